//! Connection limiter over real TCP sockets.

use std::sync::Arc;
use std::time::Duration;

use edge_listener::net::{ConnectionLimiter, Listener, ListenerError, TcpAcceptor};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

async fn limited(limit: usize) -> Arc<ConnectionLimiter<TcpAcceptor>> {
    let base = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
    Arc::new(ConnectionLimiter::new(base, limit).unwrap())
}

#[tokio::test]
async fn concurrent_dial_waits_for_close() {
    let listener = limited(1).await;
    let addr = listener.local_addr().unwrap();

    // Accepted connections are handed to the test so it controls when they close.
    let (accepted_tx, mut accepted) = mpsc::channel(2);
    {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move {
            for _ in 0..2 {
                match listener.accept().await {
                    Ok((conn, _)) => {
                        if accepted_tx.send(conn).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
    }

    let _client1 = TcpStream::connect(addr).await.unwrap();
    let _client2 = TcpStream::connect(addr).await.unwrap();

    let mut first = tokio::time::timeout(Duration::from_secs(1), accepted.recv())
        .await
        .expect("first connection should be admitted")
        .unwrap();

    let early = tokio::time::timeout(Duration::from_millis(100), accepted.recv()).await;
    assert!(early.is_err(), "second connection admitted while the first is open");
    assert_eq!(listener.available_slots(), 0);

    first.shutdown().await.unwrap();
    assert!(first.is_released());

    let second = tokio::time::timeout(Duration::from_secs(1), accepted.recv())
        .await
        .expect("second connection should be admitted once the first closes")
        .unwrap();
    assert_eq!(listener.available_slots(), 0);
    drop(second);
    assert_eq!(listener.available_slots(), 1);
}

#[tokio::test]
async fn serial_dials_both_succeed() {
    let listener = limited(1).await;
    let addr = listener.local_addr().unwrap();

    let (done_tx, mut done) = mpsc::channel(2);
    {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move {
            for _ in 0..2 {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                let mut out = [0u8; 1];
                let n = conn.read(&mut out).await.unwrap();
                assert_eq!(n, 0, "client should close without sending");
                conn.shutdown().await.unwrap();
                let _ = done_tx.send(()).await;
            }
        });
    }

    let conn1 = TcpStream::connect(addr).await.unwrap();
    drop(conn1);
    let conn2 = TcpStream::connect(addr).await.unwrap();
    drop(conn2);

    for which in ["conn1", "conn2"] {
        tokio::time::timeout(Duration::from_secs(1), done.recv())
            .await
            .unwrap_or_else(|_| panic!("timeout {which}"))
            .unwrap();
    }
}

#[tokio::test]
async fn close_releases_pending_dial() {
    let listener = limited(1).await;
    let addr = listener.local_addr().unwrap();

    let _client1 = TcpStream::connect(addr).await.unwrap();
    let (_held, _) = listener.accept().await.unwrap();

    let pending = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.accept().await.map(|_| ()) })
    };
    let _client2 = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    listener.close().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("pending accept should return promptly after close")
        .unwrap();
    assert!(matches!(result, Err(ListenerError::Closed)));
    assert!(matches!(listener.accept().await, Err(ListenerError::Closed)));
}

#[tokio::test]
async fn repeated_close_releases_once() {
    let listener = limited(2).await;
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (mut conn, _) = listener.accept().await.unwrap();
    assert_eq!(listener.available_slots(), 1);

    conn.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    assert!(!conn.is_released());

    let conn = Arc::new(Mutex::new(conn));
    let closers: Vec<_> = (0..8)
        .map(|_| {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let _ = conn.lock().await.shutdown().await;
            })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }

    assert!(conn.lock().await.is_released());
    assert_eq!(listener.available_slots(), 2);

    drop(conn);
    assert_eq!(listener.available_slots(), 2);
}

#[tokio::test]
async fn limit_holds_under_many_dials() {
    const LIMIT: usize = 3;
    let listener = limited(LIMIT).await;
    let addr = listener.local_addr().unwrap();

    let mut clients = Vec::new();
    for _ in 0..LIMIT + 2 {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }

    let mut held = Vec::new();
    for _ in 0..LIMIT {
        held.push(listener.accept().await.unwrap().0);
    }

    let extra = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
    assert!(extra.is_err(), "admitted more than {LIMIT} connections");

    held.pop();
    let (next, _) = tokio::time::timeout(Duration::from_secs(1), listener.accept())
        .await
        .expect("a freed slot should admit the next dial")
        .unwrap();
    held.push(next);
    assert_eq!(listener.available_slots(), 0);
}
