//! NIP-11 lookups driving REQ batch sizes

use super::*;
use async_trait::async_trait;
use nostr_relay_pool::{
    EventVerifier, Filter, ForwardReq, HttpNip11Fetcher, Limitation, Nip11Fetcher, RelayInfo,
    RelayUrl, SchnorrVerifier, UseOptions,
};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

struct CountingFetcher {
    calls: AtomicUsize,
    max_filters: Option<usize>,
    delay: Duration,
}

impl CountingFetcher {
    fn new(max_filters: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            max_filters,
            delay: Duration::ZERO,
        })
    }
}

#[async_trait]
impl Nip11Fetcher for CountingFetcher {
    async fn fetch(&self, url: &RelayUrl) -> nostr_relay_pool::Result<RelayInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match self.max_filters {
            Some(max_filters) => Ok(RelayInfo {
                name: Some(url.to_string()),
                limitation: Some(Limitation {
                    max_filters: Some(max_filters),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            None => Err(nostr_relay_pool::ClientError::RelayInfo(
                "no document".to_string(),
            )),
        }
    }
}

fn pool_with(fetcher: Arc<CountingFetcher>) -> RelayPool {
    init_tracing();
    let config = PoolConfig {
        skip_fetch_nip11: false,
        ..test_config(ConnectionStrategy::Lazy)
    };
    let verifier: Arc<dyn EventVerifier> = Arc::new(SchnorrVerifier);
    RelayPool::with_collaborators(config, fetcher, verifier)
}

#[tokio::test]
async fn test_fetched_limits_split_filters_once() {
    let mut relay = MockRelay::start().await;
    let fetcher = CountingFetcher::new(Some(1));
    let pool = pool_with(Arc::clone(&fetcher));
    pool.set_default_relays([&relay.url]).unwrap();

    let req = ForwardReq::with_id("split");
    let _sub = pool.use_req(&req, UseOptions::default()).unwrap();
    req.emit([Filter::new().kinds(vec![1]), Filter::new().kinds(vec![2])]);

    assert_eq!(relay.next_of("REQ").await, json!(["REQ", "split:0", {"kinds": [1]}]));
    assert_eq!(relay.next_of("REQ").await, json!(["REQ", "split:1", {"kinds": [2]}]));

    req.emit([Filter::new().kinds(vec![3]), Filter::new().kinds(vec![4])]);
    relay.next_of("REQ").await;
    relay.next_of("REQ").await;

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    let cached = pool.nip11().get(&RelayUrl::parse(&relay.url).unwrap()).unwrap();
    assert_eq!(cached.max_filters(), Some(1));
}

#[tokio::test]
async fn test_failed_fetch_falls_back_to_default_document() {
    let mut relay = MockRelay::start().await;
    let fetcher = CountingFetcher::new(None);
    let pool = pool_with(Arc::clone(&fetcher));
    pool.nip11().set_default(RelayInfo {
        limitation: Some(Limitation {
            max_filters: Some(2),
            ..Default::default()
        }),
        ..Default::default()
    });
    pool.set_default_relays([&relay.url]).unwrap();

    let req = ForwardReq::with_id("fallback");
    let _sub = pool.use_req(&req, UseOptions::default()).unwrap();
    req.emit([
        Filter::new().kinds(vec![1]),
        Filter::new().kinds(vec![2]),
        Filter::new().kinds(vec![3]),
    ]);

    assert_eq!(relay.next_of("REQ").await[1], "fallback:0");
    assert_eq!(relay.next_of("REQ").await[1], "fallback:1");

    // Failures are not cached, the next emission asks again.
    req.emit([Filter::new().kinds(vec![5])]);
    relay.next_of("REQ").await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_lookups_share_one_fetch() {
    let mut relay = MockRelay::start().await;
    let fetcher = Arc::new(CountingFetcher {
        calls: AtomicUsize::new(0),
        max_filters: Some(1),
        delay: Duration::from_millis(200),
    });
    let pool = pool_with(Arc::clone(&fetcher));
    pool.set_default_relays([&relay.url]).unwrap();

    let left = ForwardReq::with_id("left");
    let right = ForwardReq::with_id("right");
    let _left = pool.use_req(&left, UseOptions::default()).unwrap();
    let _right = pool.use_req(&right, UseOptions::default()).unwrap();
    left.emit([Filter::new().kinds(vec![1]), Filter::new().kinds(vec![2])]);
    right.emit([Filter::new().kinds(vec![3]), Filter::new().kinds(vec![4])]);

    let mut wire_ids = Vec::new();
    for _ in 0..4 {
        wire_ids.push(relay.next_of("REQ").await[1].as_str().unwrap().to_string());
    }
    wire_ids.sort();
    assert_eq!(wire_ids, vec!["left:0", "left:1", "right:0", "right:1"]);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

/// Serve one HTTP request with a NIP-11 document, returning the request head.
async fn serve_document(listener: tokio::net::TcpListener, body: String) -> String {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
    }

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/nostr+json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    stream.shutdown().await.ok();
    String::from_utf8_lossy(&request).to_lowercase()
}

#[tokio::test]
async fn test_http_fetcher_reads_information_document() {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = RelayUrl::parse(&format!("ws://{}", listener.local_addr().unwrap())).unwrap();
    let body = json!({
        "name": "mock",
        "supported_nips": [1, 11],
        "limitation": {"max_filters": 10, "max_subscriptions": 20},
        "unknown_field": true
    })
    .to_string();
    let server = tokio::spawn(serve_document(listener, body));

    let info = HttpNip11Fetcher::new(WAIT).fetch(&url).await.unwrap();
    assert_eq!(info.name.as_deref(), Some("mock"));
    assert_eq!(info.supported_nips, vec![1, 11]);
    assert_eq!(info.max_filters(), Some(10));
    assert_eq!(info.max_subscriptions(), Some(20));

    let request = server.await.unwrap();
    assert!(request.starts_with("get / http/1.1"));
    assert!(request.contains("accept: application/nostr+json"));
}

#[tokio::test]
async fn test_http_fetcher_reports_unreachable_relay() {
    let url = RelayUrl::parse(&unreachable_url().await).unwrap();
    let result = HttpNip11Fetcher::new(WAIT).fetch(&url).await;
    assert!(matches!(
        result,
        Err(nostr_relay_pool::ClientError::RelayInfo(_))
    ));
}
