//! In-process fake replica for unit tests.

use crate::address::ServerAddress;
use rntbd_protocol::{ContextResponse, Decoder, Encoder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const PARTITION_KEY_RANGE_ID: &str = "x-ms-documentdb-partitionkeyrangeid";

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Behavior {
    pub reply_delay: Duration,
    /// Negotiate, then never answer a request.
    pub silent: bool,
    /// Close the first connection after this many responses.
    pub close_first_after: Option<usize>,
    /// Answer with this request header's value as the body.
    pub echo_header: Option<&'static str>,
}

pub(crate) struct FakeReplica {
    pub address: ServerAddress,
    pub connections: Arc<AtomicUsize>,
    pub requests: Arc<AtomicUsize>,
}

pub(crate) async fn spawn_replica(behavior: Behavior) -> FakeReplica {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));

    let accepted = Arc::clone(&connections);
    let received = Arc::clone(&requests);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let index = accepted.fetch_add(1, Ordering::SeqCst);
            let close_after = if index == 0 {
                behavior.close_first_after
            } else {
                None
            };
            tokio::spawn(serve(socket, behavior, close_after, Arc::clone(&received)));
        }
    });

    FakeReplica {
        address: ServerAddress::parse(&format!("rntbd://127.0.0.1:{}/replica/1p/", port)).unwrap(),
        connections,
        requests,
    }
}

async fn serve(
    socket: TcpStream,
    behavior: Behavior,
    close_after: Option<usize>,
    received: Arc<AtomicUsize>,
) {
    let (mut reader, mut writer) = socket.into_split();
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 16 * 1024];
    let mut negotiated = false;
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_task = tokio::spawn(async move {
        let mut written = 0usize;
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                return;
            }
            written += 1;
            if close_after.is_some_and(|limit| written > limit) {
                return;
            }
        }
    });

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        decoder.extend(&buf[..n]);
        while let Ok(Some(frame)) = decoder.decode_request() {
            if !negotiated {
                negotiated = true;
                let response = ContextResponse::accepted(frame.activity_id(), "fake-replica", "1.0");
                let _ = tx.send(response.encode().unwrap().to_vec());
                continue;
            }
            received.fetch_add(1, Ordering::SeqCst);
            if behavior.silent {
                continue;
            }
            let id = frame.transport_request_id().unwrap_or_default();
            let request_headers = frame.logical_headers();
            let body = match behavior.echo_header {
                Some(name) => request_headers.get(name).cloned().unwrap_or_default(),
                None => id.to_string(),
            };
            let mut headers = HashMap::new();
            if let Some(range_id) = request_headers.get(PARTITION_KEY_RANGE_ID) {
                headers.insert(PARTITION_KEY_RANGE_ID.to_string(), range_id.clone());
            }
            let response = Encoder::build_response(
                200,
                frame.activity_id(),
                id,
                &headers,
                Some(body.as_bytes()),
            )
            .unwrap()
            .to_vec();
            let tx = tx.clone();
            let delay = behavior.reply_delay;
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let _ = tx.send(response);
            });
        }
        if writer_task.is_finished() {
            break;
        }
    }
}
