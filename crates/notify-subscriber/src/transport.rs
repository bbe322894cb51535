//! One-way stream transport: the seam between the controller and the network.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use url::Url;

use crate::types::{Error, TransportError};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw body chunks of an open stream.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Resolves once the stream handshake succeeded (the transport "open" event).
pub type OpenFuture = BoxFuture<'static, Result<ByteStream, TransportError>>;

/// Everything a transport needs to open one stream.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Fully augmented address, credentials included.
    pub url: Url,
    /// Send ambient (cookie) credentials with the request.
    pub with_credentials: bool,
}

/// Opens one-way event streams.
///
/// The returned future owns everything it needs; dropping it (or the stream
/// it yields) closes the underlying connection.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, request: OpenRequest) -> OpenFuture;
}

/// [`Transport`] over HTTP using `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    anonymous: reqwest::Client,
    credentialed: reqwest::Client,
}

impl HttpTransport {
    /// Transport with an in-memory cookie store for credentialed requests.
    pub fn new() -> Result<Self, Error> {
        Self::with_cookie_jar(Arc::new(reqwest::cookie::Jar::default()))
    }

    /// Transport that sends cookies from `jar` when a request asks for credentials.
    pub fn with_cookie_jar(jar: Arc<reqwest::cookie::Jar>) -> Result<Self, Error> {
        let anonymous = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Configuration(format!("http client: {e}")))?;
        let credentialed = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .cookie_provider(jar)
            .build()
            .map_err(|e| Error::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            anonymous,
            credentialed,
        })
    }
}

impl Transport for HttpTransport {
    fn open(&self, request: OpenRequest) -> OpenFuture {
        let client = if request.with_credentials {
            self.credentialed.clone()
        } else {
            self.anonymous.clone()
        };
        Box::pin(async move {
            let resp = client
                .get(request.url)
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache")
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                return Err(TransportError::Status(status.as_u16()));
            }

            let body = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(TransportError::Http));
            Ok(body.boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn request(server: &MockServer, path: &str) -> OpenRequest {
        OpenRequest {
            url: Url::parse(&server.url(path)).unwrap(),
            with_credentials: false,
        }
    }

    #[tokio::test]
    async fn streams_body_of_successful_response() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/sse")
                    .query_param("token", "abc")
                    .header("accept", "text/event-stream");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body("data: hello\n\n");
            })
            .await;

        let mut req = request(&server, "/sse");
        req.url.query_pairs_mut().append_pair("token", "abc");
        let transport = HttpTransport::new().unwrap();
        let stream = transport.open(req).await.unwrap();
        let body: Vec<u8> = stream
            .map(|chunk| chunk.unwrap().to_vec())
            .concat()
            .await;

        assert_eq!(body, b"data: hello\n\n");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_transport_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/sse");
                then.status(401);
            })
            .await;

        let transport = HttpTransport::new().unwrap();
        let err = match transport.open(request(&server, "/sse")).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, TransportError::Status(401)));
    }

    #[tokio::test]
    async fn credentialed_requests_carry_cookies() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/sse").cookie("session", "s3cr3t");
                then.status(200).body("");
            })
            .await;

        let base = Url::parse(&server.base_url()).unwrap();
        let jar = Arc::new(reqwest::cookie::Jar::default());
        jar.add_cookie_str("session=s3cr3t", &base);
        let transport = HttpTransport::with_cookie_jar(jar).unwrap();

        let mut req = request(&server, "/sse");
        req.with_credentials = true;
        assert!(transport.open(req).await.is_ok());
        mock.assert_async().await;
    }
}
