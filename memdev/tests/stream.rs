//! Device-core behavior: append/read/seek/poll semantics and the capacity
//! ceiling, driven through registry handles.

use std::sync::Arc;
use std::time::Duration;

use memdev::{Config, Credentials, Registry, SeekFrom};

fn tiny_registry(ceiling: usize) -> Registry {
    let config = Config {
        devices: 1,
        capacity_ceiling: ceiling,
        ..Config::default()
    };
    Registry::new(&config)
}

#[test]
fn test_ceiling_write_sequence() {
    let registry = tiny_registry(16);
    let mut h = registry.open("memdev0", Credentials::user()).unwrap();

    assert_eq!(h.write(b"HELLOWORLD").unwrap(), 10);
    assert_eq!(h.stream().len(), 10);

    assert_eq!(h.write(b"1234567890").unwrap(), 6);
    assert_eq!(h.stream().len(), 16);

    // Full device: every further write is a no-op success.
    assert_eq!(h.write(b"anything").unwrap(), 0);
    assert_eq!(h.stream().len(), 16);
    assert!(!h.poll().writable);

    // A fresh handle drains all 16 bytes with one oversized request.
    let mut r = registry.open("memdev0", Credentials::user()).unwrap();
    let mut buf = [0u8; 100];
    assert_eq!(r.read(&mut buf).unwrap(), 16);
    assert_eq!(&buf[..16], b"HELLOWORLD123456");
    assert_eq!(r.cursor(), 16);
    assert_eq!(r.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_read_at_end_is_empty_not_error() {
    let registry = tiny_registry(64);
    let mut h = registry.open("memdev0", Credentials::user()).unwrap();
    let mut buf = [0u8; 8];

    assert_eq!(h.read(&mut buf).unwrap(), 0);
    h.write(b"abc").unwrap();
    let mut r = registry.open("memdev0", Credentials::user()).unwrap();
    r.seek(SeekFrom::End(0)).unwrap();
    assert_eq!(r.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_seek_back_and_reread_is_idempotent() {
    let registry = tiny_registry(64);
    let mut h = registry.open("memdev0", Credentials::user()).unwrap();
    h.write(b"stable bytes").unwrap();

    let mut r = registry.open("memdev0", Credentials::user()).unwrap();
    let mut first = [0u8; 32];
    let n1 = r.read(&mut first).unwrap();
    assert_eq!(r.cursor(), n1);

    r.seek(SeekFrom::Start(0)).unwrap();
    let mut second = [0u8; 32];
    let n2 = r.read(&mut second).unwrap();
    assert_eq!(n1, n2);
    assert_eq!(first[..n1], second[..n2]);
}

#[test]
fn test_failed_seek_keeps_cursor_and_device_usable() {
    let registry = tiny_registry(64);
    let mut h = registry.open("memdev0", Credentials::user()).unwrap();
    h.write(b"0123456789").unwrap();
    h.seek(SeekFrom::Start(4)).unwrap();

    assert!(h.seek(SeekFrom::End(1)).is_err());
    assert!(h.seek(SeekFrom::Current(-5)).is_err());
    assert_eq!(h.cursor(), 4);

    // The rejected seeks left no lock behind: everything still works.
    assert_eq!(h.seek(SeekFrom::End(-10)).unwrap(), 0);
    let mut buf = [0u8; 10];
    assert_eq!(h.read(&mut buf).unwrap(), 10);
}

#[test]
fn test_poll_matrix_across_fill() {
    let registry = tiny_registry(4);
    let mut h = registry.open("memdev0", Credentials::user()).unwrap();

    let p = h.poll();
    assert!(!p.readable);
    assert!(p.writable);

    h.write(b"ab").unwrap();
    let mut r = registry.open("memdev0", Credentials::user()).unwrap();
    let p = r.poll();
    assert!(p.readable);
    assert!(p.writable);

    h.write(b"cd").unwrap();
    let p = r.poll();
    assert!(p.readable);
    assert!(!p.writable);

    // Cursor at the end: nothing to read, still full.
    r.seek(SeekFrom::End(0)).unwrap();
    let p = r.poll();
    assert!(!p.readable);
    assert!(!p.writable);
}

#[test]
fn test_write_advances_own_cursor_only() {
    let registry = tiny_registry(64);
    let mut a = registry.open("memdev0", Credentials::user()).unwrap();
    let mut b = registry.open("memdev0", Credentials::user()).unwrap();

    a.write(b"aaaa").unwrap();
    b.write(b"bbbb").unwrap();
    a.write(b"aaaa").unwrap();

    // Each cursor tracks the bytes written through that handle, while the
    // data itself always lands at the end.
    assert_eq!(a.cursor(), 8);
    assert_eq!(b.cursor(), 4);
    assert_eq!(a.stream().len(), 12);
}

#[test]
fn test_concurrent_writers_keep_appends_whole() {
    const WRITERS: usize = 4;
    const ROUNDS: usize = 25;
    const CHUNK: usize = 8;

    let registry = Arc::new(tiny_registry(WRITERS * ROUNDS * CHUNK));
    let mut joins = Vec::new();
    for tag in 0..WRITERS {
        let registry = Arc::clone(&registry);
        joins.push(std::thread::spawn(move || {
            let mut h = registry.open("memdev0", Credentials::user()).unwrap();
            let chunk = [tag as u8; CHUNK];
            for _ in 0..ROUNDS {
                assert_eq!(h.write(&chunk).unwrap(), CHUNK);
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }

    let stream = registry.stream(0).unwrap();
    assert_eq!(stream.len(), WRITERS * ROUNDS * CHUNK);

    // A reader observing the final length sees whole chunks: appends are
    // totally ordered and never interleave.
    let mut data = vec![0u8; stream.len()];
    assert_eq!(stream.read_at(0, &mut data), data.len());
    let mut per_tag = [0usize; WRITERS];
    for chunk in data.chunks(CHUNK) {
        let tag = chunk[0] as usize;
        assert!(chunk.iter().all(|&b| b == chunk[0]), "torn append: {chunk:?}");
        per_tag[tag] += 1;
    }
    assert_eq!(per_tag, [ROUNDS; WRITERS]);
}

#[tokio::test]
async fn test_blocked_reader_wakes_on_append() {
    let registry = Arc::new(tiny_registry(64));
    let stream = Arc::clone(registry.stream(0).unwrap());

    let (parked_tx, parked_rx) = tokio::sync::oneshot::channel();
    let waiter = {
        let stream = Arc::clone(&stream);
        tokio::spawn(async move {
            parked_tx.send(()).ok();
            stream.wait_readable(0).await
        })
    };

    parked_rx.await.unwrap();
    // Let the waiter reach its registration before the append.
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.append(b"wake").unwrap();

    assert!(waiter.await.unwrap());
    let mut buf = [0u8; 8];
    assert_eq!(stream.read_at(0, &mut buf), 4);
}

#[tokio::test]
async fn test_teardown_wakes_parked_reader() {
    let registry = tiny_registry(64);
    let stream = Arc::clone(registry.stream(0).unwrap());

    let waiter = {
        let stream = Arc::clone(&stream);
        tokio::spawn(async move { stream.wait_readable(0).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    drop(registry);
    // Woken with the teardown sentinel, not left hanging.
    assert!(!waiter.await.unwrap());
}
