use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cached_object::{CachedObjectBuilder, CachedObjectError, IntervalFactory};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::utils::*;

#[tokio::test(start_paused = true)]
async fn test_periodic_refresh() {
    setup();

    let calls = CallCounter::new();
    let object = counting(&calls)
        .refresh_interval(Duration::from_secs(10))
        .build();

    assert_eq!(*object.initialize(None).await.unwrap(), 1);
    tokio::time::sleep(Duration::from_secs(35)).await;

    object.dispose();
    tokio::time::sleep(Duration::from_secs(35)).await;

    // one initialization and three refreshes
    assert_eq!(calls.get(), 4);
    assert_eq!(object.version(), calls.get() as u64);
}

#[tokio::test(start_paused = true)]
async fn test_interval_factory_is_consulted_every_cycle() {
    setup();

    let intervals = CallCounter::new();
    let calls = CallCounter::new();
    let object = {
        let intervals = intervals.clone();
        counting(&calls)
            .refresh_interval_factory(IntervalFactory::new(move || {
                // 1s, 2s, 3s, then stop
                let n = intervals.hit() as u64;
                (n <= 3).then(|| Duration::from_secs(n))
            }))
            .build()
    };

    object.initialize(None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(intervals.get(), 4);
    assert_eq!(object.version(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_failure_keeps_value() {
    setup();

    let calls = CallCounter::new();
    let object = {
        let calls = calls.clone();
        CachedObjectBuilder::new(move |_| {
            let calls = calls.clone();
            async move {
                let n = calls.hit();
                if n == 2 {
                    anyhow::bail!("refresh {n} failed");
                }
                Ok(n)
            }
        })
        .build()
    };
    let errors = Recorder::new();
    {
        let errors = errors.clone();
        object.on_value_refresh_error(move |event| {
            errors.record((event.error.to_string(), *event.current, event.version));
        });
    }
    let refreshes = Recorder::new();
    {
        let refreshes = refreshes.clone();
        object.on_value_refreshed(move |event| {
            refreshes.record((*event.previous, *event.new, event.version));
        });
    }

    object.initialize(None).await.unwrap();
    let err = object
        .refresh_value(Duration::ZERO, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CachedObjectError::Factory(_)));
    assert!(!err.is_cancellation());
    assert_eq!(*object.value().unwrap(), 1);
    assert_eq!(object.version(), 1);
    assert_eq!(
        errors.values(),
        [("value factory failed: refresh 2 failed".to_owned(), 1, 1)]
    );

    object.refresh_value(Duration::ZERO, None).await.unwrap();
    assert_eq!(*object.value().unwrap(), 3);
    assert_eq!(object.version(), 2);
    assert_eq!(refreshes.values(), [(1, 3, 2)]);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_refresh_survives_failures() {
    setup();

    let calls = CallCounter::new();
    let object = {
        let calls = calls.clone();
        CachedObjectBuilder::new(move |_| {
            let calls = calls.clone();
            async move {
                let n = calls.hit();
                if n % 2 == 0 {
                    anyhow::bail!("flaky");
                }
                Ok(n)
            }
        })
        .refresh_interval(Duration::from_secs(1))
        .build()
    };

    object.initialize(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(4500)).await;

    // calls 2 and 4 failed
    assert_eq!(calls.get(), 5);
    assert_eq!(object.version(), 3);
    assert_eq!(*object.value().unwrap(), 5);
}

async fn throttled_refreshes(skip: Duration) -> usize {
    let calls = CallCounter::new();
    let object = counting(&calls).build();
    object.initialize(None).await.unwrap();

    for _ in 0..5 {
        object.refresh_value(skip, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    // without the initialization
    calls.get() - 1
}

#[tokio::test(start_paused = true)]
async fn test_skip_recent_refreshes() {
    setup();

    assert_eq!(throttled_refreshes(Duration::ZERO).await, 5);
    // refreshes at 3s only, 0s to 2s and 4s are too close to the previous one
    assert_eq!(throttled_refreshes(Duration::from_secs(3)).await, 1);
    // refreshes at 2s and 4s
    assert_eq!(throttled_refreshes(Duration::from_secs(2)).await, 2);
    assert_eq!(throttled_refreshes(Duration::from_secs(10)).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_refreshes_coalesce() {
    setup();

    let calls = CallCounter::new();
    let object = {
        let calls = calls.clone();
        CachedObjectBuilder::new(move |_| {
            let calls = calls.clone();
            async move {
                let n = calls.hit();
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(n)
            }
        })
        .build()
    };
    object.initialize(None).await.unwrap();

    // all of these join the single refresh that is waiting to run
    let results = join_all((0..10).map(|_| object.refresh_value(Duration::ZERO, None))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(calls.get(), 2);
    assert_eq!(object.version(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refreshes_queue_behind_running_refresh() {
    setup();

    let calls = CallCounter::new();
    let object = {
        let calls = calls.clone();
        CachedObjectBuilder::new(move |_| {
            let calls = calls.clone();
            async move {
                let n = calls.hit();
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(n)
            }
        })
        .build()
    };
    object.initialize(None).await.unwrap();

    let running = tokio::spawn({
        let object = object.clone();
        async move { object.refresh_value(Duration::ZERO, None).await }
    });
    wait_for(Duration::from_secs(1), || calls.get() == 2).await;

    // the running refresh might have missed a change, these get exactly one more
    let queued = join_all((0..5).map(|_| object.refresh_value(Duration::ZERO, None))).await;
    running.await.unwrap().unwrap();
    assert!(queued.iter().all(Result::is_ok));
    assert_eq!(calls.get(), 3);
    assert_eq!(object.version(), 3);

    // a window that covers the running refresh joins it instead
    let running = tokio::spawn({
        let object = object.clone();
        async move { object.refresh_value(Duration::ZERO, None).await }
    });
    wait_for(Duration::from_secs(1), || calls.get() == 4).await;
    object
        .refresh_value(Duration::from_millis(50), None)
        .await
        .unwrap();
    running.await.unwrap().unwrap();
    assert_eq!(calls.get(), 4);
    assert_eq!(object.version(), 4);
}

#[tokio::test]
async fn test_refcounted_cancellation() {
    setup();

    let calls = CallCounter::new();
    let fetch_token = Arc::new(Mutex::new(None::<CancellationToken>));
    let object = {
        let calls = calls.clone();
        let fetch_token = Arc::clone(&fetch_token);
        CachedObjectBuilder::new(move |token: CancellationToken| {
            let calls = calls.clone();
            let fetch_token = Arc::clone(&fetch_token);
            async move {
                if calls.hit() > 1 {
                    *fetch_token.lock().unwrap() = Some(token);
                    std::future::pending::<()>().await;
                }
                Ok(())
            }
        })
        .build()
    };
    object.initialize(None).await.unwrap();

    let cancels: Vec<_> = (0..3).map(|_| CancellationToken::new()).collect();
    let waiters: Vec<_> = cancels
        .iter()
        .map(|cancel| {
            let object = object.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { object.refresh_value(Duration::ZERO, Some(cancel)).await })
        })
        .collect();
    wait_for(Duration::from_secs(5), || fetch_token.lock().unwrap().is_some()).await;
    let fetch_token = fetch_token.lock().unwrap().clone().unwrap();

    let mut waiters = waiters.into_iter();
    for cancel in &cancels[..2] {
        cancel.cancel();
        let res = waiters.next().unwrap().await.unwrap();
        assert!(matches!(res, Err(CachedObjectError::Cancelled)));
    }
    settle().await;
    assert!(!fetch_token.is_cancelled());

    cancels[2].cancel();
    let res = waiters.next().unwrap().await.unwrap();
    assert!(matches!(res, Err(CachedObjectError::Cancelled)));
    wait_for(Duration::from_secs(5), || fetch_token.is_cancelled()).await;

    assert_eq!(calls.get(), 2);
    assert_eq!(object.version(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_timeout() {
    setup();

    let calls = CallCounter::new();
    let object = {
        let calls = calls.clone();
        CachedObjectBuilder::new(move |_| {
            let calls = calls.clone();
            async move {
                if calls.hit() > 1 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(())
            }
        })
        .refresh_timeout(Duration::from_secs(1))
        .build()
    };
    object.initialize(None).await.unwrap();

    let err = object
        .refresh_value(Duration::ZERO, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CachedObjectError::Timeout(_)));
    assert_eq!(object.version(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_initializes_pending_object() {
    setup();

    let calls = CallCounter::new();
    let object = counting(&calls).build();

    object.refresh_value(Duration::ZERO, None).await.unwrap();
    assert_eq!(calls.get(), 1);
    assert_eq!(object.version(), 1);
}

#[tokio::test]
async fn test_panicking_subscriber_releases_refresh() {
    setup();

    let calls = CallCounter::new();
    let object = counting(&calls).build();
    object.initialize(None).await.unwrap();

    let panicked = Arc::new(AtomicBool::new(false));
    {
        let panicked = Arc::clone(&panicked);
        object.on_value_refreshed(move |_| {
            if !panicked.swap(true, Ordering::SeqCst) {
                panic!("subscriber failed");
            }
        });
    }

    let first = tokio::time::timeout(
        Duration::from_secs(2),
        object.refresh_value(Duration::ZERO, None),
    )
    .await;
    assert!(matches!(first, Ok(Err(CachedObjectError::Cancelled))));
    assert!(panicked.load(Ordering::SeqCst));

    // the object keeps refreshing
    let second = tokio::time::timeout(
        Duration::from_secs(2),
        object.refresh_value(Duration::ZERO, None),
    )
    .await;
    assert!(matches!(second, Ok(Ok(()))));
    assert_eq!(calls.get(), 3);
    assert_eq!(object.version(), 3);
}
