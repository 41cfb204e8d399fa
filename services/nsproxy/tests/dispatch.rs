
use std::sync::atomic::Ordering;
use std::sync::Arc;

use harness::{announcement, dead_addr, eventually, snapshot, DispatcherHandle, MarkerBackend};
use nsproxy::{BackendRegistry, UpdateKind};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

#[tokio::test]
async fn connections_rotate_across_backends() {
    let a = MarkerBackend::spawn("A").await.unwrap();
    let b = MarkerBackend::spawn("B").await.unwrap();

    let registry = Arc::new(BackendRegistry::new());
    registry
        .sync(snapshot(&[("/svc/a", a.addr), ("/svc/b", b.addr)], 10))
        .await;

    let proxy = DispatcherHandle::spawn(Arc::clone(&registry)).await.unwrap();

    assert_eq!(proxy.exchange("hello\n").await.unwrap(), "A:hello\n");
    assert_eq!(proxy.exchange("hello\n").await.unwrap(), "B:hello\n");
    assert_eq!(proxy.exchange("hello\n").await.unwrap(), "A:hello\n");

    assert_eq!(a.connections(), 2);
    assert_eq!(b.connections(), 1);

    let stats = proxy.dispatcher.stats();
    assert!(
        eventually(|| stats.active.load(Ordering::Relaxed) == 0).await,
        "relays did not finish"
    );
    assert_eq!(stats.accepted.load(Ordering::Relaxed), 3);
    assert_eq!(stats.relayed.load(Ordering::Relaxed), 3);
    assert_eq!(stats.bytes_to_backend.load(Ordering::Relaxed), 18);
    assert_eq!(stats.bytes_from_backend.load(Ordering::Relaxed), 24);
}

#[tokio::test]
async fn binary_bytes_pass_through_unchanged() {
    let a = MarkerBackend::spawn("\u{0}\u{7f}").await.unwrap();

    let registry = Arc::new(BackendRegistry::new());
    registry.sync(snapshot(&[("/svc/a", a.addr)], 1)).await;
    let proxy = DispatcherHandle::spawn(registry).await.unwrap();

    let line = "caf\u{e9} \u{1f980}\r\n";
    assert_eq!(
        proxy.exchange(line).await.unwrap(),
        format!("\u{0}\u{7f}:{line}")
    );
}

#[tokio::test]
async fn empty_registry_closes_connection_without_dialing() {
    let registry = Arc::new(BackendRegistry::new());
    let proxy = DispatcherHandle::spawn(registry).await.unwrap();

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let mut buf = Vec::new();
    let n = stream.read_to_end(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    let stats = proxy.dispatcher.stats();
    assert!(eventually(|| stats.no_backend.load(Ordering::Relaxed) == 1).await);
    assert_eq!(stats.accepted.load(Ordering::Relaxed), 1);
    assert_eq!(stats.dial_failed.load(Ordering::Relaxed), 0);
    assert_eq!(stats.relayed.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn dial_failure_closes_connection_and_rotation_continues() {
    let dead = dead_addr().await;
    let b = MarkerBackend::spawn("B").await.unwrap();

    let registry = Arc::new(BackendRegistry::new());
    registry
        .sync(snapshot(&[("/svc/dead", dead), ("/svc/b", b.addr)], 1))
        .await;
    let proxy = DispatcherHandle::spawn(Arc::clone(&registry)).await.unwrap();

    let reply = proxy.exchange("hello\n").await;
    assert!(
        matches!(&reply, Ok(r) if r.is_empty()) || reply.is_err(),
        "unexpected reply {reply:?}"
    );

    let stats = proxy.dispatcher.stats();
    assert!(eventually(|| stats.dial_failed.load(Ordering::Relaxed) == 1).await);

    assert_eq!(proxy.exchange("hello\n").await.unwrap(), "B:hello\n");
    assert_eq!(registry.len().await, 2);
}

#[tokio::test]
async fn membership_changes_apply_to_next_connection() {
    let a = MarkerBackend::spawn("A").await.unwrap();
    let b = MarkerBackend::spawn("B").await.unwrap();
    let c = MarkerBackend::spawn("C").await.unwrap();

    let registry = Arc::new(BackendRegistry::new());
    registry
        .sync(snapshot(&[("/svc/a", a.addr), ("/svc/b", b.addr)], 1))
        .await;
    let proxy = DispatcherHandle::spawn(Arc::clone(&registry)).await.unwrap();

    assert_eq!(proxy.exchange("1\n").await.unwrap(), "A:1\n");

    // The entry about to be selected goes away; its successor wraps to a.
    registry
        .apply_update("/svc/b", None, UpdateKind::Delete)
        .await
        .unwrap();
    assert_eq!(proxy.exchange("2\n").await.unwrap(), "A:2\n");

    // Address change in place keeps the position.
    registry
        .apply_update("/svc/a", Some(announcement(c.addr).as_str()), UpdateKind::Put)
        .await
        .unwrap();
    assert_eq!(proxy.exchange("3\n").await.unwrap(), "C:3\n");

    registry
        .apply_update("/svc/b", Some(announcement(b.addr).as_str()), UpdateKind::Put)
        .await
        .unwrap();
    assert_eq!(proxy.exchange("4\n").await.unwrap(), "C:4\n");
    assert_eq!(proxy.exchange("5\n").await.unwrap(), "B:5\n");

    assert_eq!(a.connections(), 2);
}
