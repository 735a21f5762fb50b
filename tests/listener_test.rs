// ABOUTME: Listener tests against a scripted PostgreSQL wire-protocol server
// ABOUTME: Covers a server that stops answering queries but keeps delivering notifications

mod common;

use common::{fast_retry, registry, FakeMirror, FakeSource};
use mirror_sync::listener::ListenerConfig;
use mirror_sync::retry::RetryPolicy;
use mirror_sync::{MirrorTarget, SyncWorker, WorkerConfig};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn message(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(tag);
    out.extend_from_slice(&(body.len() as i32 + 4).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn notification(channel: &str, payload: &str) -> Vec<u8> {
    let mut body = 4242i32.to_be_bytes().to_vec();
    body.extend_from_slice(channel.as_bytes());
    body.push(0);
    body.extend_from_slice(payload.as_bytes());
    body.push(0);
    message(b'A', &body)
}

async fn read_message(socket: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let tag = socket.read_u8().await?;
    let len = socket.read_i32().await?;
    let mut body = vec![0; len as usize - 4];
    socket.read_exact(&mut body).await?;
    Ok((tag, body))
}

/// Answers startup and every LISTEN, then never answers another query.
/// The first unanswered query is followed by one notification.
async fn serve_stalling(mut socket: TcpStream) -> io::Result<()> {
    let len = socket.read_i32().await?;
    let mut startup = vec![0; len as usize - 4];
    socket.read_exact(&mut startup).await?;

    socket.write_all(&message(b'R', &0i32.to_be_bytes())).await?;
    let mut key_data = 4242i32.to_be_bytes().to_vec();
    key_data.extend_from_slice(&7i32.to_be_bytes());
    socket.write_all(&message(b'K', &key_data)).await?;
    socket.write_all(&message(b'Z', b"I")).await?;

    let mut stalled = false;
    loop {
        let (tag, body) = read_message(&mut socket).await?;
        match tag {
            b'X' => return Ok(()),
            b'Q' if body.starts_with(b"LISTEN") => {
                socket.write_all(&message(b'C', b"LISTEN\0")).await?;
                socket.write_all(&message(b'Z', b"I")).await?;
            }
            b'Q' if !stalled => {
                stalled = true;
                socket
                    .write_all(&notification("conversations_changes", "INSERT:1"))
                    .await?;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_unanswered_heartbeat_does_not_block_notifications() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = server.accept().await {
            tokio::spawn(serve_stalling(socket));
        }
    });

    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    source.seed_conversations(1);

    let url = format!("postgresql://app@127.0.0.1:{}/chat?sslmode=disable", port);
    let target = MirrorTarget::parse("https://mirror.example.co", Some("service-key")).unwrap();
    let mut config = WorkerConfig::new(&url, target).unwrap();
    config.retry = fast_retry();
    config.listener = ListenerConfig {
        reconnect: RetryPolicy::new(u32::MAX, Duration::from_millis(10), Duration::from_millis(50)),
        heartbeat_interval: Duration::from_millis(200),
    };
    let worker = SyncWorker::new(registry(), source.clone(), mirror.clone(), &config);

    worker.start().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while (mirror.row("conversations", "1").is_none() || worker.stats().connection_errors() == 0)
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The notification sent while the heartbeat was pending was still dispatched
    assert!(mirror.row("conversations", "1").is_some());
    // The unanswered heartbeat ended the session
    assert!(worker.stats().connection_errors() >= 1);
    let last_error = worker.health_status().last_error.unwrap();
    assert!(last_error.contains("timed out"), "{}", last_error);
    assert!(worker.is_running());

    worker.stop().await.unwrap();
}
