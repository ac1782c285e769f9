use std::sync::Arc;
use std::time::Duration;

use cached_object::{CachedObjectBuilder, CachedObjectError, UpdateMode};
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::utils::*;

#[tokio::test]
async fn test_sequential_updates_apply_in_order() {
    setup();

    let applies = CallCounter::new();
    let gate = Arc::new(Semaphore::new(0));
    let object = adder(&applies, &gate).build();
    let applied = Recorder::new();
    {
        let applied = applied.clone();
        object.on_value_updated(move |event| {
            applied.record((*event.updates, *event.new, event.version));
        });
    }

    let results = join_all((2..=6).map(|delta| object.update_value(delta, None))).await;
    assert!(results.iter().all(Result::is_ok));

    assert_eq!(
        applied.values(),
        [(2, 2, 2), (3, 5, 3), (4, 9, 4), (5, 14, 5), (6, 20, 6)]
    );
    assert_eq!(*object.value().unwrap(), 20);
    assert_eq!(object.version(), 6);
}

#[tokio::test]
async fn test_withdrawn_sequential_update_is_skipped() {
    setup();

    let applies = CallCounter::new();
    let gate = Arc::new(Semaphore::new(0));
    let object = adder(&applies, &gate).build();
    object.initialize(None).await.unwrap();

    // holds the lock until the gate opens
    let blocking = tokio::spawn({
        let object = object.clone();
        async move { object.update_value(1, None).await }
    });
    wait_for(Duration::from_secs(5), || applies.get() == 1).await;

    let cancel = CancellationToken::new();
    let withdrawn = tokio::spawn({
        let object = object.clone();
        let cancel = cancel.clone();
        async move { object.update_value(10, Some(cancel)).await }
    });
    let kept = tokio::spawn({
        let object = object.clone();
        async move { object.update_value(100, None).await }
    });
    settle().await;
    cancel.cancel();
    assert!(matches!(
        withdrawn.await.unwrap(),
        Err(CachedObjectError::Cancelled)
    ));

    gate.add_permits(1);
    blocking.await.unwrap().unwrap();
    kept.await.unwrap().unwrap();

    assert_eq!(*object.value().unwrap(), 101);
    assert_eq!(applies.get(), 2);
    assert_eq!(object.version(), 3);
}

#[tokio::test]
async fn test_coalesced_updates_share_single_pass() {
    setup();

    let applies = CallCounter::new();
    let gate = Arc::new(Semaphore::new(0));
    let object = adder(&applies, &gate)
        .update_mode(UpdateMode::Coalesced)
        .build();
    object.initialize(None).await.unwrap();

    let blocking = tokio::spawn({
        let object = object.clone();
        async move { object.update_value(1, None).await }
    });
    wait_for(Duration::from_secs(5), || applies.get() == 1).await;

    // the first one is queued, the others attach to it and their deltas are dropped
    let queued: Vec<_> = [2, 3, 4]
        .into_iter()
        .map(|delta| {
            let object = object.clone();
            tokio::spawn(async move { object.update_value(delta, None).await })
        })
        .collect();
    settle().await;

    gate.add_permits(1);
    blocking.await.unwrap().unwrap();
    for update in queued {
        update.await.unwrap().unwrap();
    }

    assert_eq!(applies.get(), 2);
    assert_eq!(*object.value().unwrap(), 3);
    assert_eq!(object.version(), 3);
}

#[tokio::test]
async fn test_update_failure_keeps_value() {
    setup();

    let object = CachedObjectBuilder::new(|_| async { Ok(10u32) })
        .with_updates(|value: Arc<u32>, delta: Arc<u32>, _| async move {
            value
                .checked_sub(*delta)
                .ok_or_else(|| anyhow::anyhow!("underflow"))
        })
        .build();
    let errors = Recorder::new();
    {
        let errors = errors.clone();
        object.on_value_update_error(move |event| {
            errors.record((*event.current, event.updates.as_deref().copied(), event.version));
        });
    }

    object.update_value(3, None).await.unwrap();
    let err = object.update_value(8, None).await.unwrap_err();
    assert!(matches!(err, CachedObjectError::Update(_)));
    assert_eq!(err.to_string(), "update failed: underflow");

    assert_eq!(*object.value().unwrap(), 7);
    assert_eq!(object.version(), 2);
    assert_eq!(errors.values(), [(7, Some(8), 2)]);

    // the lock was released
    object.update_value(7, None).await.unwrap();
    assert_eq!(*object.value().unwrap(), 0);
}

#[tokio::test]
async fn test_refresh_goes_before_waiting_updates() {
    setup();

    let applies = CallCounter::new();
    let gate = Arc::new(Semaphore::new(0));
    let object = adder(&applies, &gate)
        .update_mode(UpdateMode::Coalesced)
        .build();
    let order = Recorder::new();
    {
        let order = order.clone();
        object.on_value_updated(move |event| order.record(format!("update {}", event.updates)));
    }
    {
        let order = order.clone();
        object.on_value_refreshed(move |_| order.record("refresh".to_owned()));
    }
    object.initialize(None).await.unwrap();

    let blocking = tokio::spawn({
        let object = object.clone();
        async move { object.update_value(1, None).await }
    });
    wait_for(Duration::from_secs(5), || applies.get() == 1).await;

    // the update is waiting for the lock before the refresh is
    let update = tokio::spawn({
        let object = object.clone();
        async move { object.update_value(2, None).await }
    });
    settle().await;
    let refresh = tokio::spawn({
        let object = object.clone();
        async move { object.refresh_value(Duration::ZERO, None).await }
    });
    settle().await;

    gate.add_permits(1);
    blocking.await.unwrap().unwrap();
    refresh.await.unwrap().unwrap();
    update.await.unwrap().unwrap();

    assert_eq!(order.values(), ["update 1", "refresh", "update 2"]);
    // the refresh reset the value to 0
    assert_eq!(*object.value().unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refreshes_and_updates_are_exclusive() {
    setup();

    let probe = ConcurrencyProbe::new();
    let object = {
        let refresh_probe = probe.clone();
        let update_probe = probe.clone();
        CachedObjectBuilder::new(move |_| {
            let probe = refresh_probe.clone();
            async move {
                let _section = probe.enter();
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok(0u64)
            }
        })
        .with_updates(move |value: Arc<u64>, delta: Arc<u64>, _| {
            let probe = update_probe.clone();
            async move {
                let _section = probe.enter();
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(*value + *delta)
            }
        })
        .build()
    };
    object.initialize(None).await.unwrap();

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let object = object.clone();
            tokio::spawn(async move {
                if i % 3 == 0 {
                    object.refresh_value(Duration::ZERO, None).await
                } else if i % 3 == 1 {
                    object.pull_updates(None).await.or(Ok(()))
                } else {
                    object.update_value(i, None).await
                }
            })
        })
        .collect();
    for task in join_all(tasks).await {
        task.unwrap().unwrap();
    }

    assert_eq!(probe.max_concurrency(), 1);
    assert_eq!(probe.current(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pull_updates() {
    setup();

    let fetches = CallCounter::new();
    let object = {
        let fetches = fetches.clone();
        CachedObjectBuilder::new(|_| async { Ok(vec![0u32]) })
            .with_updates(|value: Arc<Vec<u32>>, delta: Arc<Vec<u32>>, _| async move {
                Ok(value.iter().chain(delta.iter()).copied().collect())
            })
            .fetch_updates(move |value: Arc<Vec<u32>>, _| {
                let fetches = fetches.clone();
                async move {
                    fetches.hit();
                    Ok(vec![value.len() as u32])
                }
            })
            .update_interval(Duration::from_secs(5))
            .build()
    };

    object.initialize(None).await.unwrap();
    object.pull_updates(None).await.unwrap();
    assert_eq!(*object.value().unwrap(), [0, 1]);

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(fetches.get(), 3);
    assert_eq!(*object.value().unwrap(), [0, 1, 2, 3]);
    assert_eq!(object.version(), 4);
}

#[tokio::test]
async fn test_update_initializes_pending_object() {
    setup();

    let applies = CallCounter::new();
    let gate = Arc::new(Semaphore::new(0));
    let object = adder(&applies, &gate).build();

    object.update_value(5, None).await.unwrap();
    assert_eq!(*object.value().unwrap(), 5);
    assert_eq!(object.version(), 2);
}

#[tokio::test]
async fn test_panicking_subscriber_releases_coalesced_update() {
    setup();

    let applies = CallCounter::new();
    let gate = Arc::new(Semaphore::new(0));
    let object = adder(&applies, &gate)
        .update_mode(UpdateMode::Coalesced)
        .build();
    object.initialize(None).await.unwrap();
    object.on_value_updated(|event| {
        if *event.updates == 2 {
            panic!("subscriber failed");
        }
    });

    let blocking = tokio::spawn({
        let object = object.clone();
        async move { object.update_value(1, None).await }
    });
    wait_for(Duration::from_secs(5), || applies.get() == 1).await;

    // queued behind the running update, so it runs on its own task
    let queued = tokio::spawn({
        let object = object.clone();
        async move { object.update_value(2, None).await }
    });
    settle().await;

    gate.add_permits(1);
    blocking.await.unwrap().unwrap();
    let res = tokio::time::timeout(Duration::from_secs(2), queued).await;
    assert!(matches!(res, Ok(Ok(Err(CachedObjectError::Cancelled)))));

    object.update_value(4, None).await.unwrap();
    assert_eq!(*object.value().unwrap(), 7);
    assert_eq!(object.version(), 4);
}

#[tokio::test]
async fn test_panicking_subscriber_keeps_update_queue_running() {
    setup();

    let applies = CallCounter::new();
    let gate = Arc::new(Semaphore::new(0));
    let object = adder(&applies, &gate).build();
    object.initialize(None).await.unwrap();
    object.on_value_updated(|event| {
        if *event.updates == 2 {
            panic!("subscriber failed");
        }
    });

    let res = tokio::time::timeout(Duration::from_secs(2), object.update_value(2, None)).await;
    assert!(matches!(res, Ok(Err(CachedObjectError::Cancelled))));

    let res = tokio::time::timeout(Duration::from_secs(2), object.update_value(3, None)).await;
    assert!(matches!(res, Ok(Ok(()))));
    assert_eq!(*object.value().unwrap(), 5);
    assert_eq!(object.version(), 3);
}
