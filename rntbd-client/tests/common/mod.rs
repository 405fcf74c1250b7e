//! Fake replica used by the integration tests.

#![allow(dead_code)]

use rntbd_client::ServerAddress;
use rntbd_protocol::{ContextResponse, Decoder, Encoder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
pub enum Mode {
    /// Reply to every request with `response-<id>` as the body, in reverse
    /// order of arrival within each batch read from the socket.
    Echo,
    /// Negotiate, then never reply.
    Silent,
    /// Negotiate, read this many requests without replying, then close.
    FaultAfter(usize),
    /// Like `FaultAfter` on the first connection only; later connections echo.
    FaultFirstAfter(usize),
    /// Negotiate, stop reading for this long, then echo.
    Stall(Duration),
}

pub struct FakeServer {
    pub address: ServerAddress,
    pub connections: Arc<AtomicUsize>,
    pub requests: Arc<AtomicUsize>,
}

impl FakeServer {
    pub async fn start(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));

        let accepted = Arc::clone(&connections);
        let received = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let index = accepted.fetch_add(1, Ordering::SeqCst);
                let mode = match mode {
                    Mode::FaultFirstAfter(limit) if index == 0 => Mode::FaultAfter(limit),
                    Mode::FaultFirstAfter(_) => Mode::Echo,
                    other => other,
                };
                tokio::spawn(serve(socket, mode, Arc::clone(&received)));
            }
        });

        Self {
            address: ServerAddress::parse(&format!(
                "rntbd://127.0.0.1:{}/apps/test/services/svc/partitions/0/replicas/1p/",
                port
            ))
            .unwrap(),
            connections,
            requests,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub async fn wait_for_requests(&self, count: usize) {
        for _ in 0..500 {
            if self.requests() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server saw {} requests, expected {}", self.requests(), count);
    }
}

pub fn response_body(request_id: u32) -> String {
    format!("response-{}", request_id)
}

async fn serve(socket: TcpStream, mode: Mode, received: Arc<AtomicUsize>) {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                return;
            }
        }
    });

    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut negotiated = false;
    let mut stalled = false;
    let mut seen = 0usize;

    loop {
        if let (Mode::Stall(pause), true, false) = (mode, negotiated, stalled) {
            stalled = true;
            tokio::time::sleep(pause).await;
        }
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.extend(&buf[..n]);

        let mut batch = Vec::new();
        while let Ok(Some(frame)) = decoder.decode_request() {
            if !negotiated {
                negotiated = true;
                let response = ContextResponse::accepted(frame.activity_id(), "fake-server", "1.0");
                let _ = tx.send(response.encode().unwrap().to_vec());
                continue;
            }
            received.fetch_add(1, Ordering::SeqCst);
            seen += 1;
            batch.push(frame);
        }

        match mode {
            Mode::Echo | Mode::Stall(_) => {
                for frame in batch.into_iter().rev() {
                    let id = frame.transport_request_id().unwrap();
                    let response = Encoder::build_response(
                        200,
                        frame.activity_id(),
                        id,
                        &HashMap::new(),
                        Some(response_body(id).as_bytes()),
                    )
                    .unwrap();
                    let _ = tx.send(response.to_vec());
                }
            }
            Mode::Silent => {}
            Mode::FaultAfter(limit) => {
                if seen >= limit {
                    return;
                }
            }
            Mode::FaultFirstAfter(_) => unreachable!("resolved per connection"),
        }
    }
}
