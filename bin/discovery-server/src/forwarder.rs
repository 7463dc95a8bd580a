//! Request forwarding to the service instance a lookup selected

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

/// Pooled HTTP client that relays a request to a backend and buffers its reply
pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl RequestForwarder {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(connector);

        Self { client, timeout }
    }

    /// Forward `request` to `target_url` and return the backend's response.
    ///
    /// Connection failures and timeouts are errors; any response the backend
    /// sends, whatever its status, is returned as is.
    pub async fn forward<B>(&self, target_url: &str, request: Request<B>) -> Result<Response<Bytes>>
    where
        B: Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        debug!("Forwarding request to: {}", target_url);

        let uri: Uri = target_url
            .parse()
            .with_context(|| format!("Invalid target URL: {}", target_url))?;

        let (mut parts, body) = request.into_parts();
        let body_bytes = body
            .collect()
            .await
            .context("Failed to read request body")?
            .to_bytes();

        parts.headers = Self::forwarded_headers(&parts.headers, &uri);
        parts.uri = uri;

        let forwarded_request = Request::from_parts(parts, Full::new(body_bytes));

        let response = match tokio_timeout(self.timeout, self.client.request(forwarded_request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("Backend request error: {}", e);
                return Err(anyhow!("Error communicating with backend service: {}", e));
            }
            Err(_) => {
                warn!("Backend request timeout after {}s", self.timeout.as_secs());
                return Err(anyhow!(
                    "Backend service did not respond within {}s",
                    self.timeout.as_secs()
                ));
            }
        };

        debug!("Backend responded with status: {}", response.status());

        let (mut response_parts, body) = response.into_parts();
        let response_bytes = body
            .collect()
            .await
            .context("Failed to read backend response body")?
            .to_bytes();
        response_parts.headers = Self::strip_hop_by_hop(&response_parts.headers);

        Ok(Response::from_parts(response_parts, response_bytes))
    }

    /// Request headers minus hop-by-hop ones, with `Host` pointed at the backend
    fn forwarded_headers(headers: &HeaderMap, target: &Uri) -> HeaderMap {
        let mut filtered = Self::strip_hop_by_hop(headers);
        if let Some(authority) = target.authority() {
            if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
                filtered.insert(HOST, host);
            }
        }
        filtered
    }

    fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
        let mut filtered = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            if !Self::is_hop_by_hop_header(name.as_str()) {
                filtered.append(name.clone(), value.clone());
            }
        }
        filtered
    }

    /// Header names arrive lowercased from `HeaderName`
    fn is_hop_by_hop_header(name: &str) -> bool {
        matches!(
            name,
            "connection"
                | "keep-alive"
                | "proxy-authenticate"
                | "proxy-authorization"
                | "te"
                | "trailers"
                | "transfer-encoding"
                | "upgrade"
        )
    }
}
