use std::sync::Arc;
use std::time::Duration;

use cached_object::{CachedObjectBuilder, CachedObjectError, CachedObjectState};
use tokio::sync::Semaphore;

use crate::utils::*;

#[tokio::test(start_paused = true)]
async fn test_mapped_follows_source_refreshes() {
    setup();

    let calls = CallCounter::new();
    let source = counting(&calls).build();
    let mapped = source.map(|value| value * 10);

    assert_eq!(*mapped.initialize(None).await.unwrap(), 10);
    assert_eq!(source.version(), 1);
    assert_eq!(mapped.version(), 1);

    for expected in 2..=4u64 {
        source.refresh_value(Duration::ZERO, None).await.unwrap();
        wait_for(Duration::from_secs(1), || mapped.version() == expected).await;
        assert_eq!(
            *mapped.value().unwrap(),
            *source.value().unwrap() * 10
        );
    }

    // nothing else happens in the background
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(mapped.version(), 4);
    assert_eq!(calls.get(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_mapped_initialization_is_lazy() {
    setup();

    let calls = CallCounter::new();
    let source = counting(&calls).build();
    let doubled = source.map(|value| value * 2);
    let described = doubled.map(|value| format!("value is {value}"));
    assert_eq!(calls.get(), 0);
    assert_eq!(described.name(), "cached_object.mapped.mapped");

    // source refreshes do not touch derived objects that were never initialized
    source.initialize(None).await.unwrap();
    source.refresh_value(Duration::ZERO, None).await.unwrap();
    settle().await;
    assert_eq!(doubled.state(), CachedObjectState::PendingInitialization);

    assert_eq!(*described.initialize(None).await.unwrap(), "value is 4");
    assert_eq!(calls.get(), 2);
    assert_eq!(source.state(), CachedObjectState::Ready);
    assert_eq!(doubled.state(), CachedObjectState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_mapped_with_updates() {
    setup();

    let applies = CallCounter::new();
    let gate = Arc::new(Semaphore::new(0));
    let source = adder(&applies, &gate).build();
    let mapped_updates = CallCounter::new();
    let mapped = {
        let mapped_updates = mapped_updates.clone();
        source.map_with_updates(
            |value, _| async move { Ok(*value * 2) },
            move |value: Arc<usize>, delta: Arc<usize>, _| {
                let mapped_updates = mapped_updates.clone();
                async move {
                    mapped_updates.hit();
                    Ok(*value + *delta * 2)
                }
            },
        )
    };
    assert_eq!(*mapped.initialize(None).await.unwrap(), 0);

    for delta in [2, 3, 4] {
        source.update_value(delta, None).await.unwrap();
    }
    wait_for(Duration::from_secs(1), || mapped.version() == 4).await;

    assert_eq!(*source.value().unwrap(), 9);
    assert_eq!(*mapped.value().unwrap(), 18);
    assert_eq!(mapped_updates.get(), 3);

    // refreshes still recompute the whole value
    source.refresh_value(Duration::ZERO, None).await.unwrap();
    wait_for(Duration::from_secs(1), || mapped.version() == 5).await;
    assert_eq!(*mapped.value().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_mapped_updates_fall_back_to_refresh() {
    setup();

    let applies = CallCounter::new();
    let gate = Arc::new(Semaphore::new(0));
    let source = adder(&applies, &gate).build();
    let mapped = source.map(|value| value + 1000);

    assert_eq!(*mapped.initialize(None).await.unwrap(), 1000);
    source.update_value(5, None).await.unwrap();
    wait_for(Duration::from_secs(1), || mapped.version() == 2).await;
    assert_eq!(*mapped.value().unwrap(), 1005);

    let res = mapped.pull_updates(None).await;
    assert!(matches!(res, Err(CachedObjectError::UpdatesNotSupported)));
}

#[tokio::test(start_paused = true)]
async fn test_mapped_failure_is_reported() {
    setup();

    let calls = CallCounter::new();
    let source = counting(&calls).build();
    let mapped = source.map_async(|value, _| async move {
        if *value == 2 {
            anyhow::bail!("cannot map {value}");
        }
        Ok(*value)
    });
    let errors = Recorder::new();
    {
        let errors = errors.clone();
        mapped.on_value_refresh_error(move |event| {
            errors.record((event.error.to_string(), *event.current));
        });
    }

    mapped.initialize(None).await.unwrap();
    source.refresh_value(Duration::ZERO, None).await.unwrap();
    wait_for(Duration::from_secs(1), || !errors.is_empty()).await;

    assert_eq!(
        errors.values(),
        [("value factory failed: cannot map 2".to_owned(), 1)]
    );
    assert_eq!(mapped.version(), 1);

    // the next source version maps just fine
    source.refresh_value(Duration::ZERO, None).await.unwrap();
    wait_for(Duration::from_secs(1), || mapped.version() == 2).await;
    assert_eq!(*mapped.value().unwrap(), 3);
}

#[tokio::test]
async fn test_dropped_mapped_object_unsubscribes() {
    setup();

    let calls = CallCounter::new();
    let source = counting(&calls).build();
    let mapped_calls = CallCounter::new();
    let mapped = {
        let mapped_calls = mapped_calls.clone();
        source.map(move |value| {
            mapped_calls.hit();
            *value
        })
    };
    mapped.initialize(None).await.unwrap();
    drop(mapped);

    source.refresh_value(Duration::ZERO, None).await.unwrap();
    settle().await;
    assert_eq!(mapped_calls.get(), 1);

    // derived objects keep their source alive
    let weak_check = CachedObjectBuilder::new(|_| async { Ok(()) }).build();
    let derived = weak_check.map(|_| ());
    drop(weak_check);
    derived.initialize(None).await.unwrap();
}
