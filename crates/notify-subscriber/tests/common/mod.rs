#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use notify_subscriber::{
    ConnectOptions, ConnectionHandle, ConnectionState, OpenFuture, OpenRequest, Snapshot,
    Transport, TransportError,
};
use tokio::sync::mpsc;
use url::Url;

pub const STREAM_URL: &str = "https://api.example.test/notifications/stream";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Explicit token, watchdog off.
pub fn options() -> ConnectOptions {
    let mut options = ConnectOptions::new(STREAM_URL);
    options.token = Some("tok".to_string());
    options.heartbeat_timeout = Duration::ZERO;
    options
}

pub async fn wait_state(handle: &ConnectionHandle, state: ConnectionState) -> Snapshot {
    let mut rx = handle.subscribe();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(600),
        rx.wait_for(|s| s.state == state),
    )
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
    .unwrap();
    *snapshot
}

pub fn query(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

type Chunk = Result<Bytes, TransportError>;

/// Records every open and hands back a stream fed from the test.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    opens: Vec<OpenRequest>,
    streams: Vec<mpsc::UnboundedSender<Chunk>>,
    fail_next: usize,
    fail_all: bool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject the next `n` opens with a 503.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().unwrap().fail_next = n;
    }

    pub fn fail_all(&self, fail: bool) {
        self.state.lock().unwrap().fail_all = fail;
    }

    pub fn opens(&self) -> Vec<Url> {
        let state = self.state.lock().unwrap();
        state.opens.iter().map(|r| r.url.clone()).collect()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens.len()
    }

    /// Write raw bytes to the most recently opened stream.
    pub fn send(&self, chunk: &str) {
        let state = self.state.lock().unwrap();
        let tx = state.streams.last().expect("no open stream");
        let _ = tx.send(Ok(Bytes::from(chunk.to_string())));
    }

    /// End the most recently opened stream as a server would.
    pub fn close(&self) {
        self.state.lock().unwrap().streams.pop();
    }
}

impl Transport for MockTransport {
    fn open(&self, request: OpenRequest) -> OpenFuture {
        let mut state = self.state.lock().unwrap();
        state.opens.push(request);
        if state.fail_all || state.fail_next > 0 {
            state.fail_next = state.fail_next.saturating_sub(1);
            return Box::pin(async { Err(TransportError::Status(503)) });
        }

        let (tx, rx) = mpsc::unbounded_channel::<Chunk>();
        state.streams.push(tx);
        let stream =
            futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|c| (c, rx)) })
                .boxed();
        Box::pin(async move { Ok(stream) })
    }
}
