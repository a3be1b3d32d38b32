//! Access serializer tests: mutual exclusion across threads and independent
//! lock instances (stand-ins for separate processes), release on every exit
//! path, stale marker recovery and the async acquire path.

use recordkeep::core::config::Config;
use recordkeep::core::error::{Error, ErrorKind};
use recordkeep::storage::layout::StorageLayout;
use recordkeep::storage::serializer::{AccessSerializer, MarkerFileLock, MutualExclusion};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> Config {
    Config {
        serializer_poll_interval: Duration::from_millis(5),
        ..Config::with_storage_path(dir.path())
    }
}

fn serializer(dir: &TempDir) -> AccessSerializer {
    let config = test_config(dir);
    let layout = StorageLayout::new(config.storage_path.clone()).unwrap();
    AccessSerializer::marker_file(&layout, &config)
}

/// Every thread gets its own serializer over the same root, like separate
/// clients would. At no point may two of them be inside at once.
#[test]
fn test_no_two_holders_at_once() {
    let dir = TempDir::new().unwrap();
    let num_threads = 8;
    let rounds = 20;
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let serializer = serializer(&dir);
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..rounds {
                    serializer
                        .run(|| {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_micros(200));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
}

#[test]
fn test_marker_exists_only_while_held() {
    let dir = TempDir::new().unwrap();
    let serializer = serializer(&dir);
    let marker = dir.path().join(".lock");

    assert!(!marker.exists());
    serializer
        .run(|| {
            assert!(marker.exists());
            Ok(())
        })
        .unwrap();
    assert!(!marker.exists());
}

#[test]
fn test_released_on_error_and_panic() {
    let dir = TempDir::new().unwrap();
    let serializer = serializer(&dir);
    let marker = dir.path().join(".lock");

    let result: Result<(), Error> =
        serializer.run(|| Err(Error::integrity("UNIQUE constraint failed: Cases.case_name")));
    assert_eq!(result.unwrap_err().kind, ErrorKind::Integrity);
    assert!(!marker.exists());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = serializer.run(|| -> recordkeep::core::error::Result<()> { panic!("boom") });
    }));
    assert!(outcome.is_err());
    assert!(!marker.exists());
}

#[test]
fn test_second_client_waits_for_release() {
    let dir = TempDir::new().unwrap();
    let first = serializer(&dir);
    let second = serializer(&dir);
    let released_at = Arc::new(parking_lot::Mutex::new(None::<Instant>));

    let guard = first.acquire().unwrap();
    let waiter_released_at = released_at.clone();
    let waiter = thread::spawn(move || {
        let _guard = second.acquire().unwrap();
        let acquired_at = Instant::now();
        let released = (*waiter_released_at.lock()).expect("acquired before release");
        assert!(acquired_at >= released);
    });

    thread::sleep(Duration::from_millis(50));
    *released_at.lock() = Some(Instant::now());
    drop(guard);

    waiter.join().unwrap();
}

#[test]
fn test_stale_marker_is_cleared() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join(".lock");
    fs::write(&marker, "crashed-holder 2024-01-01T00:00:00Z\n").unwrap();

    let lock = MarkerFileLock::new(marker.clone(), Duration::from_millis(5), Some(Duration::from_millis(50)));
    thread::sleep(Duration::from_millis(100));

    lock.acquire().unwrap();
    let contents = fs::read_to_string(&marker).unwrap();
    assert!(contents.starts_with(&lock.holder().to_string()));
    lock.release().unwrap();
    assert!(!marker.exists());
}

#[test]
fn test_stale_detection_disabled_keeps_waiting() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join(".lock");
    fs::write(&marker, "someone\n").unwrap();

    let lock = MarkerFileLock::new(marker.clone(), Duration::from_millis(5), None);
    thread::sleep(Duration::from_millis(30));

    assert!(!lock.try_acquire().unwrap());
    assert!(marker.exists());
    assert!(lock.marker_age().unwrap().unwrap() >= Duration::from_millis(30));
}

#[test]
fn test_release_without_marker_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    let lock = MarkerFileLock::new(dir.path().join(".lock"), Duration::from_millis(5), None);
    lock.release().unwrap();
}

#[cfg(unix)]
#[test]
fn test_flock_excludes_other_handles() {
    use recordkeep::storage::serializer::FlockLock;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".flock");
    let first = FlockLock::new(path.clone(), Duration::from_millis(5));
    let second = FlockLock::new(path, Duration::from_millis(5));

    assert!(first.try_acquire().unwrap());
    assert!(!second.try_acquire().unwrap());
    first.release().unwrap();
    assert!(second.try_acquire().unwrap());
    second.release().unwrap();
}

#[tokio::test]
async fn test_async_acquire_waits_for_sync_holder() {
    let dir = TempDir::new().unwrap();
    let holder = serializer(&dir);
    let waiter = serializer(&dir);

    let guard = holder.acquire().unwrap();
    let pending = tokio::spawn(async move {
        let _guard = waiter.acquire_async().await.unwrap();
        Instant::now()
    });

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!pending.is_finished());
    let released = Instant::now();
    drop(guard);

    let acquired = pending.await.unwrap();
    assert!(acquired >= released);
}

/// A live holder that stays inside longer than the stale threshold keeps its
/// marker fresh; a waiter must not treat it as abandoned.
#[test]
fn test_long_holder_is_not_reaped() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join(".lock");
    let stale_after = Some(Duration::from_millis(50));
    let holder = MarkerFileLock::new(marker.clone(), Duration::from_millis(5), stale_after);
    let waiter = MarkerFileLock::new(marker.clone(), Duration::from_millis(5), stale_after);

    assert!(holder.try_acquire().unwrap());
    let deadline = Instant::now() + Duration::from_millis(200);
    while Instant::now() < deadline {
        assert!(!waiter.try_acquire().unwrap(), "waiter entered while the holder was inside");
        thread::sleep(Duration::from_millis(5));
    }

    holder.release().unwrap();
    assert!(!marker.exists());
    assert!(waiter.try_acquire().unwrap());
    waiter.release().unwrap();
}

#[test]
fn test_long_run_keeps_exclusion() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        stale_marker_after: Some(Duration::from_millis(40)),
        ..test_config(&dir)
    };
    let layout = StorageLayout::new(config.storage_path.clone()).unwrap();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(3));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let serializer = AccessSerializer::marker_file(&layout, &config);
            let (inside, max_inside, barrier) = (inside.clone(), max_inside.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                serializer
                    .run(|| {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(150));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
}

#[test]
fn test_release_leaves_foreign_marker() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join(".lock");
    let lock = MarkerFileLock::new(marker.clone(), Duration::from_millis(5), None);

    assert!(lock.try_acquire().unwrap());
    fs::write(&marker, "someone-else 2024-01-01T00:00:00Z\n").unwrap();

    lock.release().unwrap();
    assert!(marker.exists());
    assert_eq!(fs::read_to_string(&marker).unwrap(), "someone-else 2024-01-01T00:00:00Z\n");
}

#[test]
fn test_young_marker_is_never_removed() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join(".lock");
    fs::write(&marker, "other-client 2024-01-01T00:00:00Z\n").unwrap();

    let lock = MarkerFileLock::new(marker.clone(), Duration::from_millis(5), Some(Duration::from_secs(10)));
    for _ in 0..20 {
        assert!(!lock.try_acquire().unwrap());
        thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(fs::read_to_string(&marker).unwrap(), "other-client 2024-01-01T00:00:00Z\n");
    assert!(!dir.path().join(".lock.reap").exists());
}
