//! Integration tests for the relay pool against scripted in-process relays.

mod nip11;
mod strategy;

use bitcoin::secp256k1::{Keypair, Message as SchnorrMessage, Secp256k1, SecretKey};
use futures::{SinkExt, StreamExt};
use nostr_relay_pool::{
    BackoffConfig, ConnectionState, ConnectionStrategy, Event, PoolConfig, RelayConfig, RelayPool,
    event_hash,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(300);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Pool configuration for tests: fast retries, no NIP-11 fetches, no signature checks.
pub fn test_config(strategy: ConnectionStrategy) -> PoolConfig {
    PoolConfig {
        connection_strategy: strategy,
        skip_fetch_nip11: true,
        skip_verify: true,
        ok_timeout: Duration::from_secs(2),
        relay: RelayConfig {
            connect_timeout: Duration::from_secs(2),
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
                max_attempts: 3,
                jitter: 0.0,
            },
        },
        ..Default::default()
    }
}

pub fn test_pool(strategy: ConnectionStrategy) -> RelayPool {
    init_tracing();
    RelayPool::new(test_config(strategy))
}

pub async fn wait_state(pool: &RelayPool, url: &str, state: ConnectionState) {
    assert!(
        pool.wait_for_state(url, state, WAIT).await,
        "{} never reached {}, now {:?}",
        url,
        state,
        pool.get_relay_status(url)
    );
}

enum Outgoing {
    Text(String),
    Close(u16),
}

/// A relay that records client frames and answers only when told to.
pub struct MockRelay {
    pub url: String,
    frames: mpsc::UnboundedReceiver<Value>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Outgoing>>>>,
    connections: Arc<AtomicUsize>,
    close_on_accept: Arc<AtomicU16>,
    task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let (frames_tx, frames) = mpsc::unbounded_channel();
        let current = Arc::new(Mutex::new(None));
        let connections = Arc::new(AtomicUsize::new(0));
        let close_on_accept = Arc::new(AtomicU16::new(0));

        let task = tokio::spawn({
            let current = Arc::clone(&current);
            let connections = Arc::clone(&connections);
            let close_on_accept = Arc::clone(&close_on_accept);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let code = close_on_accept.load(Ordering::SeqCst);
                    if code != 0 {
                        let _ = tx.send(Outgoing::Close(code));
                    }
                    *current.lock() = Some(tx);
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, frames_tx.clone(), rx));
                }
            }
        });

        Self {
            url,
            frames,
            current,
            connections,
            close_on_accept,
            task,
        }
    }

    /// Number of WebSocket handshakes accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Close every future connection right after the handshake with `code`.
    pub fn close_on_accept(&self, code: Option<u16>) {
        self.close_on_accept.store(code.unwrap_or(0), Ordering::SeqCst);
    }

    pub fn send(&self, frame: Value) {
        self.outgoing(Outgoing::Text(frame.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        self.outgoing(Outgoing::Text(text.to_string()));
    }

    pub fn send_event(&self, wire_subscription_id: &str, event: &Event) {
        self.send(json!(["EVENT", wire_subscription_id, event]));
    }

    pub fn send_eose(&self, wire_subscription_id: &str) {
        self.send(json!(["EOSE", wire_subscription_id]));
    }

    /// Close the current connection from the relay side.
    pub fn close(&self, code: u16) {
        self.outgoing(Outgoing::Close(code));
    }

    fn outgoing(&self, message: Outgoing) {
        let current = self.current.lock();
        let tx = current.as_ref().expect("no client connected");
        tx.send(message).expect("connection already gone");
    }

    /// Next frame the client sent.
    pub async fn next_frame(&mut self) -> Value {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("relay stopped")
    }

    /// Next frame of the given type (`REQ`, `CLOSE`, `EVENT`), skipping others.
    pub async fn next_of(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame[0] == kind {
                return frame;
            }
        }
    }

    pub async fn assert_quiet(&mut self) {
        if let Ok(Some(frame)) = timeout(QUIET, self.frames.recv()).await {
            panic!("unexpected frame: {}", frame);
        }
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    frames: mpsc::UnboundedSender<Value>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        let _ = frames.send(value);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            command = outgoing.recv() => match command {
                Some(Outgoing::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Utf8Bytes::from_static(""),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => break,
            },
        }
    }
}

/// A ws:// URL nothing listens on.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}", addr)
}

/// Event with a valid id and signature.
pub fn signed_event(content: &str) -> Event {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[3u8; 32]).unwrap();
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let (xonly, _) = keypair.x_only_public_key();

    let mut event = Event {
        id: String::new(),
        pubkey: hex::encode(xonly.serialize()),
        created_at: 1_700_000_000,
        kind: 1,
        tags: vec![],
        content: content.to_string(),
        sig: String::new(),
    };
    event.id = event_hash(&event).unwrap();
    let digest = hex::decode(&event.id).unwrap();
    let message = SchnorrMessage::from_digest_slice(&digest).unwrap();
    event.sig = hex::encode(secp.sign_schnorr_no_aux_rand(&message, &keypair).serialize());
    event
}

/// Structurally valid event whose signature does not check out.
pub fn unsigned_event(content: &str) -> Event {
    let mut event = signed_event(content);
    event.sig = "00".repeat(64);
    event
}
