use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::ln::bootstrap::resolve_and_connect;

#[tokio::test]
async fn test_connects_to_reachable_address() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let (tx, rx) = oneshot::channel();

    resolve_and_connect(
        "127.0.0.1".to_string(),
        port,
        move |_stream, addr| {
            tx.send(addr).expect("report connection");
        },
        || panic!("must not fail"),
    );

    let (_conn, _) = listener.accept().await.expect("accept");
    let addr = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("connected in time")
        .expect("callback ran");
    assert_eq!(addr.port(), port);
}

#[tokio::test]
async fn test_failure_reported_exactly_once() {
    // Bind then drop, so the port is (almost certainly) refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let (tx, rx) = oneshot::channel();

    resolve_and_connect(
        "127.0.0.1".to_string(),
        port,
        |_stream, _addr| panic!("must not connect"),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            tx.send(()).expect("report failure");
        },
    );

    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("failed in time")
        .expect("callback ran");
    // Give any spurious second invocation a chance to show up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_suppresses_failure_callback() {
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();

    let handle = resolve_and_connect(
        "127.0.0.1".to_string(),
        1,
        |_stream, _addr| {},
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );
    // Cancelled before the attempt is polled: no notification either way.
    handle.cancel();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}
