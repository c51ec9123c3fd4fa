//! Unit pool contracts: broadcast completion, quiescence exclusivity, and
//! the failure path that never invokes the callback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memdev::{DeviceError, UnitPool};
use parking_lot::Mutex;

#[tokio::test]
async fn test_broadcast_reaches_every_unit() {
    let pool = UnitPool::start(3).unwrap();
    let seen: Arc<Mutex<Vec<(usize, Option<String>)>>> = Arc::new(Mutex::new(Vec::new()));
    let cb_seen = Arc::clone(&seen);

    let completed = pool
        .broadcast(Arc::new(move |ctx| {
            let name = std::thread::current().name().map(str::to_string);
            cb_seen.lock().push((ctx.unit, name));
        }))
        .await;
    assert_eq!(completed, 3);

    let mut seen = seen.lock().clone();
    seen.sort_unstable();
    for (unit, name) in &seen {
        assert_eq!(name.as_deref(), Some(format!("unit/{unit}").as_str()));
    }
    let units: Vec<usize> = seen.iter().map(|(u, _)| *u).collect();
    assert_eq!(units, [0, 1, 2]);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_quiescence_holds_off_other_work() {
    let pool = Arc::new(UnitPool::start(3).unwrap());
    let marks: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
    let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
    let entered_tx = Arc::new(Mutex::new(Some(entered_tx)));
    let go_rx = Arc::new(Mutex::new(Some(go_rx)));

    let excl = {
        let pool = Arc::clone(&pool);
        let marks = Arc::clone(&marks);
        tokio::spawn(async move {
            pool.run_exclusive(Arc::new(move |_ctx| {
                marks.lock().push("exclusive:enter".to_string());
                if let Some(tx) = entered_tx.lock().take() {
                    let _ = tx.send(());
                }
                if let Some(rx) = go_rx.lock().take() {
                    let _ = rx.recv_timeout(Duration::from_secs(2));
                }
                marks.lock().push("exclusive:exit".to_string());
            }))
            .await
        })
    };

    // The callback is running, so every other unit has acknowledged its
    // park. Work submitted now must wait for the release.
    entered_rx.await.unwrap();
    let bcast = {
        let pool = Arc::clone(&pool);
        let marks = Arc::clone(&marks);
        tokio::spawn(async move {
            pool.broadcast(Arc::new(move |ctx| {
                marks.lock().push(format!("unit:{}", ctx.unit));
            }))
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(marks.lock().len(), 1, "broadcast ran into a quiesced pool");

    go_tx.send(()).unwrap();
    excl.await.unwrap().unwrap();
    assert_eq!(bcast.await.unwrap(), 3);

    let marks = marks.lock();
    assert_eq!(marks[0], "exclusive:enter");
    assert_eq!(marks[1], "exclusive:exit");
    let mut rest: Vec<&str> = marks[2..].iter().map(String::as_str).collect();
    rest.sort_unstable();
    assert_eq!(rest, ["unit:0", "unit:1", "unit:2"]);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_quiescence_after_shutdown_never_invokes_callback() {
    let pool = UnitPool::start(2).unwrap();
    pool.shutdown().await;

    let invoked = Arc::new(AtomicUsize::new(0));
    let cb = Arc::clone(&invoked);
    let err = pool
        .run_exclusive(Arc::new(move |_ctx| {
            cb.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap_err();

    assert_eq!(err, DeviceError::ResourceExhausted);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(pool.broadcast(Arc::new(|_ctx| {})).await, 0);
}

#[tokio::test]
async fn test_single_unit_pool_quiesces_trivially() {
    let pool = UnitPool::start(1).unwrap();
    let invoked = Arc::new(AtomicUsize::new(0));
    let cb = Arc::clone(&invoked);

    pool.run_exclusive(Arc::new(move |_ctx| {
        cb.fetch_add(1, Ordering::SeqCst);
    }))
    .await
    .unwrap();

    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_jobs_on_one_unit_do_not_interleave() {
    let pool = UnitPool::start(1).unwrap();
    let trace: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

    for round in 0..4 {
        let cb_trace = Arc::clone(&trace);
        pool.broadcast(Arc::new(move |_ctx| {
            cb_trace.lock().push(round);
            // A slow job; the next one must still start strictly after it.
            std::thread::sleep(Duration::from_millis(5));
            cb_trace.lock().push(round);
        }))
        .await;
    }

    assert_eq!(*trace.lock(), [0, 0, 1, 1, 2, 2, 3, 3]);
    pool.shutdown().await;
}
