//! Integration tests for deferred content and its blocking flush

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use h2_completion::callback::from_fns;
use h2_completion::{Blocker, Callback, Cause, DeferredConfig, DeferredContent, Error};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run `flush` on a helper thread and report its result on a channel.
fn spawn_flush(content: &Arc<DeferredContent>) -> mpsc::Receiver<Result<(), Error>> {
    let (tx, rx) = mpsc::channel();
    let content = content.clone();
    thread::spawn(move || {
        let _ = tx.send(content.flush());
    });
    rx
}

#[test]
fn test_when_empty_flush_does_not_block() {
    init_tracing();
    let content = DeferredContent::new();
    assert!(content.flush().is_ok());
}

#[test]
fn test_offer_flush_blocks_until_acknowledged() {
    init_tracing();
    let content = Arc::new(DeferredContent::new());
    assert!(content.offer(Bytes::new()));

    let flushed = spawn_flush(&content);
    assert!(matches!(
        flushed.recv_timeout(Duration::from_secs(1)),
        Err(mpsc::RecvTimeoutError::Timeout)
    ));

    let cursor = content.cursor();
    assert_eq!(cursor.next().unwrap(), Some(Bytes::new()));
    cursor.succeeded();

    let result = flushed
        .recv_timeout(Duration::from_secs(5))
        .expect("flush did not return");
    assert!(result.is_ok());
}

#[test]
fn test_close_flush_does_not_block() {
    let content = DeferredContent::new();
    content.close();
    assert!(content.flush().is_ok());
    assert!(content.is_closed());
}

#[test]
fn test_close_next_on_cursor_is_no_such_element() {
    let content = DeferredContent::new();
    content.close();

    let cursor = content.cursor();
    assert!(!cursor.has_next());
    assert!(matches!(cursor.next(), Err(Error::NoSuchElement)));
    assert!(!cursor.has_next());
}

#[test]
fn test_has_next_while_closed_content_is_pending() {
    let content = DeferredContent::new();
    content.offer(Bytes::from_static(b"tail"));
    content.close();

    let cursor = content.cursor();
    assert!(cursor.has_next());
    assert_eq!(cursor.next().unwrap(), Some(Bytes::from_static(b"tail")));
    assert!(!cursor.has_next());
    assert!(matches!(cursor.next(), Err(Error::NoSuchElement)));
}

#[test]
fn test_open_and_empty_cursor_has_nothing_yet() {
    let content = DeferredContent::new();
    let cursor = content.cursor();
    assert!(cursor.has_next());
    assert_eq!(cursor.next().unwrap(), None);
}

#[test]
fn test_cursor_is_shared() {
    let content = DeferredContent::with_config(DeferredConfig::default().with_initial_capacity(2));
    assert!(Arc::ptr_eq(&content.cursor(), &content.cursor()));
}

#[test]
fn test_fail_wakes_blocked_flush() {
    let content = Arc::new(DeferredContent::new());
    let failures = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let sink = failures.clone();
        content.offer_with(
            Bytes::from_static(name.as_bytes()),
            from_fns(|| {}, move |cause: &Cause| sink.lock().unwrap().push(cause.clone())),
        );
    }
    // one chunk yielded, one still queued
    assert!(content.cursor().next().unwrap().is_some());

    let flushed = spawn_flush(&content);
    assert!(matches!(
        flushed.recv_timeout(Duration::from_millis(200)),
        Err(mpsc::RecvTimeoutError::Timeout)
    ));

    let cause = Cause::msg("stream reset");
    assert!(content.fail(cause.clone()));
    match flushed.recv_timeout(Duration::from_secs(5)) {
        Ok(Err(Error::Failed(c))) => assert!(c.ptr_eq(&cause)),
        other => panic!("Expected failed flush, got {other:?}"),
    }

    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|c| c.ptr_eq(&cause)));
}

#[test]
fn test_fail_twice_is_suppressed() {
    let content = DeferredContent::new();
    let first = Cause::msg("first");
    let second = Cause::msg("second");
    assert!(content.fail(first.clone()));
    assert!(!content.fail(second.clone()));
    assert!(Cause::are_associated(&first, &second));
    assert!(!content.offer(Bytes::from_static(b"late")));
    assert!(matches!(content.cursor().next(), Err(Error::Failed(_))));
}

#[test]
fn test_cursor_failure_fails_content() {
    let content = DeferredContent::new();
    content.offer(Bytes::from_static(b"body"));
    let cursor = content.cursor();
    assert!(cursor.next().unwrap().is_some());

    let cause = Cause::msg("connection closed");
    cursor.failed(cause.clone());
    match content.flush() {
        Err(Error::Failed(c)) => assert!(c.ptr_eq(&cause)),
        other => panic!("Expected failed flush, got {other:?}"),
    }
    // acknowledging after the failure is harmless
    cursor.succeeded();
    assert_eq!(content.outstanding(), 0);
}

#[test]
fn test_flush_timeout_expires() {
    let content = DeferredContent::new();
    content.offer(Bytes::from_static(b"stuck"));
    let timeout = Duration::from_millis(50);
    match content.flush_timeout(timeout) {
        Err(Error::FlushTimeout(d)) => assert_eq!(d, timeout),
        other => panic!("Expected flush timeout, got {other:?}"),
    }

    let cursor = content.cursor();
    cursor.next().unwrap();
    cursor.succeeded();
    assert!(content.flush_timeout(timeout).is_ok());
}

#[test]
fn test_chunk_callback_succeeds_on_acknowledgement() {
    let content = DeferredContent::new();
    let acknowledged = Arc::new(AtomicUsize::new(0));
    let counter = acknowledged.clone();
    content.offer_with(
        Bytes::from_static(b"chunk"),
        from_fns(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_: &Cause| {},
        ),
    );

    let cursor = content.cursor();
    cursor.next().unwrap();
    assert_eq!(acknowledged.load(Ordering::SeqCst), 0);
    cursor.succeeded();
    assert_eq!(acknowledged.load(Ordering::SeqCst), 1);
}

#[test]
fn test_offers_come_out_in_order() {
    let content = DeferredContent::new();
    let parts: Vec<Bytes> = (0..10).map(|i| Bytes::from(format!("part-{i}"))).collect();
    for part in &parts {
        assert!(content.offer(part.clone()));
    }
    content.close();

    let cursor = content.cursor();
    let mut drained = Vec::new();
    while cursor.has_next() {
        drained.push(cursor.next().unwrap().unwrap());
        cursor.succeeded();
    }
    assert_eq!(drained, parts);
    assert!(content.flush().is_ok());
}

#[test]
fn test_blocker_per_chunk() {
    let content = Arc::new(DeferredContent::new());
    let blocker = Arc::new(Blocker::new());
    content.offer_with(Bytes::from_static(b"frame"), blocker.clone());
    assert!(!blocker.is_done());

    let consumer = {
        let cursor = content.cursor();
        thread::spawn(move || {
            while cursor.next().unwrap().is_none() {
                thread::yield_now();
            }
            cursor.succeeded();
        })
    };
    assert!(blocker.block_timeout(Duration::from_secs(5)).is_ok());
    consumer.join().unwrap();
    assert!(content.flush().is_ok());
}

#[test]
fn test_producer_and_consumer_threads() {
    init_tracing();
    const CHUNKS: usize = 200;
    let content = Arc::new(DeferredContent::new());

    let consumer = {
        let cursor = content.cursor();
        thread::spawn(move || {
            let mut received = 0usize;
            while cursor.has_next() {
                match cursor.next() {
                    Ok(Some(_)) => {
                        received += 1;
                        cursor.succeeded();
                    }
                    Ok(None) => thread::yield_now(),
                    Err(e) => panic!("Unexpected cursor error: {e}"),
                }
            }
            received
        })
    };

    for i in 0..CHUNKS {
        assert!(content.offer(Bytes::from(vec![i as u8; 8])));
        if i % 50 == 49 {
            assert!(content.flush_timeout(Duration::from_secs(5)).is_ok());
        }
    }
    content.close();
    assert_eq!(consumer.join().unwrap(), CHUNKS);
    assert!(content.flush().is_ok());
    assert_eq!(content.outstanding(), 0);
}
