//! HTTP API: heartbeats, proxied lookups, registry snapshot, health and metrics

use crate::forwarder::RequestForwarder;
use crate::metrics::{
    DiscoveryMetrics, LOOKUP_BAD_GATEWAY, LOOKUP_FORWARDED, LOOKUP_NOT_FOUND, LOOKUP_UNAVAILABLE,
};
use anyhow::Result;
use bytes::Bytes;
use discovery_balancer::{HubHandle, LoadBalancer};
use discovery_core::{normalize_path, HeartbeatMessage, ServiceRecord, ServiceRegistry};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const JSON: &str = "application/json";
const TEXT: &str = "text/plain; charset=utf-8";
const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4";

/// Body pushed to subscribers and served on `GET /services`
#[derive(Debug, Serialize)]
pub struct ServiceSnapshot {
    pub services: Vec<ServiceRecord>,
}

/// Everything a request handler needs
pub struct AppState {
    balancer: Arc<dyn LoadBalancer>,
    hub: HubHandle,
    metrics: DiscoveryMetrics,
    forwarder: RequestForwarder,
    service_prefix: String,
    key_digest: Option<Vec<u8>>,
}

impl AppState {
    pub fn new(
        balancer: Arc<dyn LoadBalancer>,
        hub: HubHandle,
        metrics: DiscoveryMetrics,
        forward_timeout: Duration,
    ) -> Self {
        Self {
            balancer,
            hub,
            metrics,
            forwarder: RequestForwarder::new(forward_timeout),
            service_prefix: "/get-service".to_string(),
            key_digest: None,
        }
    }

    pub fn with_service_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.service_prefix = prefix.into();
        self
    }

    /// Require heartbeats to carry `key` as a bearer token
    pub fn with_key(mut self, key: Option<&str>) -> Self {
        self.key_digest = key.map(|key| Sha256::digest(key.as_bytes()).to_vec());
        if let Some(digest) = &self.key_digest {
            info!(
                "Heartbeat authentication enabled (key fingerprint {})",
                &hex::encode(digest)[..12]
            );
        }
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.balancer.registry()
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn metrics(&self) -> &DiscoveryMetrics {
        &self.metrics
    }

    /// Current registry contents as JSON, ordered by path then id
    pub async fn snapshot(&self) -> Result<Bytes> {
        let mut services = self.registry().get_services().await;
        services.sort_by(|a, b| {
            a.path
                .cmp(&b.path)
                .then_with(|| a.service_id.cmp(&b.service_id))
        });
        self.metrics.registered_services.set(services.len() as i64);

        Ok(Bytes::from(serde_json::to_vec(&ServiceSnapshot {
            services,
        })?))
    }

    /// Push the current snapshot to every subscriber
    pub async fn publish_snapshot(&self) {
        let payload = match self.snapshot().await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize registry snapshot: {}", e);
                return;
            }
        };

        if self.hub.broadcaster().send(payload).await.is_err() {
            debug!("Broadcast hub stopped; snapshot not published");
        }
    }

    /// Digests are compared so the key length does not leak through timing
    fn is_authorized(&self, token: Option<&str>) -> bool {
        match &self.key_digest {
            None => true,
            Some(expected) => token
                .map(|token| Sha256::digest(token.as_bytes()).as_slice() == expected.as_slice())
                .unwrap_or(false),
        }
    }

    /// Remainder of `path` below the proxy prefix, if it falls under it
    fn service_route<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.service_prefix == "/" {
            return Some(path);
        }
        let rest = path.strip_prefix(self.service_prefix.as_str())?;
        (rest.is_empty() || rest.starts_with('/')).then_some(rest)
    }
}

/// Route one request
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, hyper::Error>
where
    B: Body,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("{} {}", method, path);

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/healthz") => respond(StatusCode::OK, TEXT, "OK\n"),
        (&Method::GET, "/metrics") => match state.metrics.gather() {
            Ok(text) => respond(StatusCode::OK, PROMETHEUS_TEXT, text),
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    TEXT,
                    "Failed to gather metrics\n",
                )
            }
        },
        (&Method::GET, "/services") => match state.snapshot().await {
            Ok(snapshot) => respond(StatusCode::OK, JSON, snapshot),
            Err(e) => {
                warn!("Failed to serialize registry snapshot: {}", e);
                respond(StatusCode::INTERNAL_SERVER_ERROR, TEXT, "Internal Server Error\n")
            }
        },
        (&Method::POST, "/heartbeat") => heartbeat(req, &state).await,
        _ => match state.service_route(&path).map(str::to_string) {
            Some(rest) => lookup(req, &state, &rest).await,
            None => respond(StatusCode::NOT_FOUND, TEXT, "Not Found\n"),
        },
    };

    Ok(response)
}

async fn heartbeat<B>(req: Request<B>, state: &AppState) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let token = bearer_token(req.headers());

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            state.metrics.record_heartbeat_failure("body");
            return respond(
                StatusCode::BAD_REQUEST,
                TEXT,
                format!("Failed to read heartbeat: {}\n", e),
            );
        }
    };

    let message: HeartbeatMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            state.metrics.record_heartbeat_failure("malformed");
            return respond(
                StatusCode::BAD_REQUEST,
                TEXT,
                format!("Malformed heartbeat: {}\n", e),
            );
        }
    };

    if !state.is_authorized(token.as_deref()) {
        warn!(
            "Unauthorized heartbeat for {} on {}",
            message.service_id, message.path
        );
        state.metrics.record_heartbeat_failure("unauthorized");
        match state
            .registry()
            .deregister_service(&message.path, &message.service_id)
            .await
        {
            Ok(_) => state.publish_snapshot().await,
            Err(e) => debug!("Nothing to deregister after failed auth: {}", e),
        }
        return respond(StatusCode::UNAUTHORIZED, TEXT, "Unauthorized\n");
    }

    let record = ServiceRecord::from(message);
    let service_id = record.service_id.clone();
    if let Err(e) = state.balancer.add_service(record).await {
        debug!("Rejected heartbeat for {}: {}", service_id, e);
        state.metrics.record_heartbeat_failure("invalid");
        return respond(StatusCode::BAD_REQUEST, TEXT, format!("{}\n", e));
    }

    state.metrics.heartbeats_total.inc();
    state.publish_snapshot().await;

    respond(StatusCode::OK, JSON, r#"{"status":"ok"}"#)
}

async fn lookup<B>(req: Request<B>, state: &AppState, rest: &str) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let lookup_path = match normalize_path(rest) {
        path if path.is_empty() => "/".to_string(),
        path => path,
    };

    let record = match state.balancer.get_next_service(&lookup_path).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            state.metrics.record_lookup(LOOKUP_UNAVAILABLE);
            return respond(
                StatusCode::SERVICE_UNAVAILABLE,
                TEXT,
                format!("Service Unavailable: no instances for {}\n", lookup_path),
            );
        }
        Err(e) if e.is_not_found() => {
            state.metrics.record_lookup(LOOKUP_NOT_FOUND);
            return respond(StatusCode::NOT_FOUND, TEXT, format!("Not Found: {}\n", e));
        }
        Err(e) => {
            warn!("Lookup for {} failed: {}", lookup_path, e);
            return respond(StatusCode::INTERNAL_SERVER_ERROR, TEXT, format!("{}\n", e));
        }
    };

    let target_url = build_target_url(&record, rest, req.uri().query());
    match state.forwarder.forward(&target_url, req).await {
        Ok(response) => {
            state.metrics.record_lookup(LOOKUP_FORWARDED);
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Full::new(body))
        }
        Err(e) => {
            warn!("Forwarding to {} failed: {:#}", record.service_id, e);
            state.metrics.record_lookup(LOOKUP_BAD_GATEWAY);
            respond(
                StatusCode::BAD_GATEWAY,
                TEXT,
                format!("Bad Gateway: {}\n", record.service_id),
            )
        }
    }
}

/// `http://<ip>:<port>/<rest>?<query>`
pub fn build_target_url(record: &ServiceRecord, rest: &str, query: Option<&str>) -> String {
    let path = if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    };

    match query {
        Some(query) if !query.is_empty() => {
            format!("http://{}{}?{}", record.address(), path, query)
        }
        _ => format!("http://{}{}", record.address(), path),
    }
}

/// Token from `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
