//! Admin API server (control plane)
//!
//! Bound broadly but guarded by a boundary filter: a request is only served
//! when the connection's local IP equals the configured private IP, so the
//! control plane stays reachable solely via the intended interface. Everything
//! else gets 403.

use crate::allowlist::{AllowlistStore, Ring};
use crate::error::{json_response, response, ApiError};
use crate::events::EventKinds;
use crate::gateway::GatewayClient;
use crate::registry::{Registration, SubscriberRegistry, Subscriber};
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, LazyLock};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

static PHONE_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?\d{10,14}$").expect("invalid regex"));

/// Shared state handed to every admin handler
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<SubscriberRegistry>,
    pub allowlist: Arc<AllowlistStore>,
    pub gateway: Arc<GatewayClient>,
}

/// Admin API server
pub struct AdminServer {
    listener: TcpListener,
    private_ip: IpAddr,
    state: AdminState,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        private_ip: IpAddr,
        state: AdminState,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            private_ip,
            state,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            addr = %self.listener.local_addr()?,
            private_ip = %self.private_ip,
            "Admin API listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = self.state.clone();
                            let private_ip = self.private_ip;
                            let local_ip = match stream.local_addr() {
                                Ok(local) => Some(local.ip()),
                                Err(e) => {
                                    warn!(remote = %addr, error = %e, "Failed to read local address");
                                    None
                                }
                            };
                            tokio::spawn(async move {
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let state = state.clone();
                                    async move {
                                        let response = match local_ip {
                                            Some(local) if local == private_ip => {
                                                serve_request(req, &state).await
                                            }
                                            local => {
                                                warn!(
                                                    remote = %addr,
                                                    local = ?local,
                                                    expected = %private_ip,
                                                    "Rejecting admin request on wrong interface"
                                                );
                                                response(StatusCode::FORBIDDEN, "Forbidden")
                                            }
                                        };
                                        Ok::<_, std::convert::Infallible>(response)
                                    }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_request(req: Request<Incoming>, state: &AdminState) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(path = %path, error = %e, "Failed to read request body");
            return response(StatusCode::BAD_REQUEST, "failed to read body");
        }
    };

    route(state, &method, &path, query.as_deref(), &body).await
}

/// Dispatch one admin request; split out from the connection plumbing so
/// routing is testable without a socket
pub async fn route(
    state: &AdminState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let result = match (method, path) {
        (&Method::GET, "/health") => health(state).await,
        (&Method::POST, "/register") => register(state, body),
        (&Method::GET, "/clients") => clients(state),
        (&Method::POST, "/allowlist") => allowlist_add(state, query),
        (&Method::GET, "/allowlist") => allowlist_all(state),
        (&Method::DELETE, "/allowlist") => allowlist_remove(state, query),
        (&Method::GET, path) if path.starts_with("/allowlist/") => {
            allowlist_ring(state, path.trim_start_matches("/allowlist/"))
        }
        (&Method::POST, "/send") => send(state, body).await,
        _ => return response(StatusCode::NOT_FOUND, "not found"),
    };

    result.unwrap_or_else(ApiError::into_response)
}

type HandlerResult = Result<Response<Full<Bytes>>, ApiError>;

async fn health(state: &AdminState) -> HandlerResult {
    let timestamp = Utc::now().to_rfc3339();
    let body = match state.gateway.health().await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": VERSION,
                "timestamp": timestamp,
                "gateway": "healthy",
            })
            .to_string(),
        ),
        Err(e) => json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "version": VERSION,
                "timestamp": timestamp,
                "gateway": "unhealthy",
                "error": e.to_string(),
            })
            .to_string(),
        ),
    };
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    id: String,
    #[serde(default)]
    webhook_url: String,
    #[serde(default)]
    ring: String,
    #[serde(flatten)]
    kinds: EventKinds,
}

fn register(state: &AdminState, body: &[u8]) -> HandlerResult {
    let request: RegisterRequest = serde_json::from_slice(body)
        .map_err(|_| ApiError::Validation("invalid JSON".to_string()))?;

    let id_len = request.id.chars().count();
    if id_len == 0 || id_len > 128 {
        return Err(ApiError::Validation(
            "id must be between 1 and 128 characters".to_string(),
        ));
    }
    if request.webhook_url.is_empty() {
        return Err(ApiError::Validation("webhook_url is required".to_string()));
    }
    if request.ring.is_empty() {
        return Err(ApiError::Validation("ring is required".to_string()));
    }
    let ring: Ring = request
        .ring
        .parse()
        .map_err(|e: crate::allowlist::InvalidRing| ApiError::Validation(e.to_string()))?;

    info!(id = %request.id, url = %request.webhook_url, ring = %ring, "Registering subscriber");
    state.registry.upsert(Registration {
        id: request.id.clone(),
        webhook_url: request.webhook_url,
        ring,
        kinds: request.kinds,
    });

    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({"status": "registered", "id": request.id}).to_string(),
    ))
}

fn clients(state: &AdminState) -> HandlerResult {
    let snapshot: HashMap<String, Subscriber> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|sub| (sub.id.clone(), sub))
        .collect();

    let body = serde_json::to_string(&snapshot)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to encode clients: {}", e)))?;
    Ok(json_response(StatusCode::OK, body))
}

fn allowlist_add(state: &AdminState, query: Option<&str>) -> HandlerResult {
    let number = query_param(query, "number")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::Validation("number parameter is required".to_string()))?;
    let ring = query_param(query, "ring")
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ApiError::Validation("ring parameter is required".to_string()))?;

    let ring: Ring = ring
        .parse()
        .map_err(|e: crate::allowlist::InvalidRing| ApiError::Validation(e.to_string()))?;

    if !PHONE_NUMBER_RE.is_match(&number) {
        return Err(ApiError::Validation(format!(
            "invalid phone number: {}",
            number
        )));
    }

    state.allowlist.add(&number, ring)?;

    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({"status": "added", "number": number, "ring": ring}).to_string(),
    ))
}

fn allowlist_all(state: &AdminState) -> HandlerResult {
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({"allowed_numbers": state.allowlist.all()}).to_string(),
    ))
}

fn allowlist_ring(state: &AdminState, segment: &str) -> HandlerResult {
    if segment.is_empty() || segment.contains('/') {
        return Ok(response(StatusCode::NOT_FOUND, "not found"));
    }

    // an unknown ring is simply empty, not an error
    let numbers = match segment.parse::<Ring>() {
        Ok(ring) => state.allowlist.numbers_in(ring),
        Err(_) => Vec::new(),
    };

    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({"ring": segment, "numbers": numbers}).to_string(),
    ))
}

fn allowlist_remove(state: &AdminState, query: Option<&str>) -> HandlerResult {
    let number = query_param(query, "number")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::Validation("number parameter is required".to_string()))?;

    state.allowlist.remove(&number)?;

    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({"status": "removed", "number": number}).to_string(),
    ))
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    #[serde(default)]
    phone_numbers: Vec<String>,
    #[serde(default)]
    message: String,
    sim_number: Option<i64>,
}

async fn send(state: &AdminState, body: &[u8]) -> HandlerResult {
    let request: SendRequest = serde_json::from_slice(body)
        .map_err(|_| ApiError::Validation("invalid JSON".to_string()))?;

    if request.phone_numbers.is_empty() {
        return Err(ApiError::Validation("phone_numbers is required".to_string()));
    }
    if request.message.is_empty() {
        return Err(ApiError::Validation("message is required".to_string()));
    }

    let result = state
        .gateway
        .send_message(&request.phone_numbers, &request.message, request.sim_number)
        .await
        .map_err(ApiError::Gateway)?;

    Ok(json_response(StatusCode::ACCEPTED, result.to_string()))
}

/// Pull one query parameter, percent-decoded. `+` stays literal so phone
/// numbers survive without double-encoding.
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| percent_decode(key) == name)
        .map(|(_, value)| percent_decode(value))
}

fn percent_decode(s: &str) -> String {
    fn hex_val(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;

    fn state_with_gateway(base_url: &str) -> AdminState {
        AdminState {
            registry: Arc::new(SubscriberRegistry::new(RegistryConfig::default().ttl())),
            allowlist: Arc::new(AllowlistStore::open_in_memory().unwrap()),
            gateway: Arc::new(GatewayClient::new(base_url, "sms", "pw").unwrap()),
        }
    }

    fn state() -> AdminState {
        // points at a closed port; only gateway-probing routes care
        state_with_gateway("http://127.0.0.1:1")
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn register_body(id: &str, ring: &str) -> Vec<u8> {
        serde_json::json!({
            "id": id,
            "webhook_url": "http://backend.example",
            "ring": ring,
            "sms_received": true,
            "sms_failed": true,
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_register_and_list_clients() {
        let state = state();

        let response = route(&state, &Method::POST, "/register", None, &register_body("sub-1", "prod")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["status"], "registered");
        assert_eq!(value["id"], "sub-1");

        let response = route(&state, &Method::GET, "/clients", None, b"").await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["sub-1"]["webhook_url"], "http://backend.example");
        assert_eq!(value["sub-1"]["ring"], "prod");
        assert_eq!(value["sub-1"]["sms_received"], true);
        assert_eq!(value["sub-1"]["sms_sent"], false);
    }

    #[tokio::test]
    async fn test_register_validation() {
        let state = state();

        let cases: Vec<Vec<u8>> = vec![
            b"not json".to_vec(),
            register_body("", "prod"),
            register_body(&"x".repeat(129), "prod"),
            register_body("sub-1", "staging"),
            serde_json::json!({"id": "sub-1", "ring": "prod"})
                .to_string()
                .into_bytes(),
        ];
        for body in cases {
            let response = route(&state, &Method::POST, "/register", None, &body).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        assert_eq!(state.registry.len(), 0);

        // 128 chars is the inclusive maximum
        let response =
            route(&state, &Method::POST, "/register", None, &register_body(&"x".repeat(128), "prod")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_allowlist_add_and_get() {
        let state = state();

        let response = route(
            &state,
            &Method::POST,
            "/allowlist",
            Some("number=+15551112222&ring=prod"),
            b"",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["status"], "added");
        assert_eq!(value["number"], "+15551112222");
        assert_eq!(value["ring"], "prod");

        let response = route(&state, &Method::GET, "/allowlist", None, b"").await;
        let value = body_json(response).await;
        assert_eq!(value["allowed_numbers"]["+15551112222"], "prod");

        let response = route(&state, &Method::GET, "/allowlist/prod", None, b"").await;
        let value = body_json(response).await;
        assert_eq!(value["numbers"], serde_json::json!(["+15551112222"]));

        let response = route(&state, &Method::GET, "/allowlist/ppe", None, b"").await;
        let value = body_json(response).await;
        assert_eq!(value["numbers"], serde_json::json!([]));

        // unknown ring segment is an empty list, not an error
        let response = route(&state, &Method::GET, "/allowlist/staging", None, b"").await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["numbers"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_allowlist_add_percent_encoded_number() {
        let state = state();

        let response = route(
            &state,
            &Method::POST,
            "/allowlist",
            Some("number=%2B15551112222&ring=ppe"),
            b"",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.allowlist.ring_of("+15551112222"), Some(crate::allowlist::Ring::Ppe));
    }

    #[tokio::test]
    async fn test_allowlist_add_validation() {
        let state = state();

        let cases = [
            None,
            Some("ring=prod"),
            Some("number=+15551112222"),
            Some("number=+15551112222&ring=staging"),
            Some("number=abc&ring=prod"),
            Some("number=+123&ring=prod"),
            Some("number=+123456789012345&ring=prod"),
        ];
        for query in cases {
            let response = route(&state, &Method::POST, "/allowlist", query, b"").await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "query: {:?}", query);
        }
        assert!(state.allowlist.all().is_empty());
    }

    #[tokio::test]
    async fn test_allowlist_reassignment_is_rejected() {
        let state = state();

        let query = Some("number=+15551112222&ring=prod");
        let response = route(&state, &Method::POST, "/allowlist", query, b"").await;
        assert_eq!(response.status(), StatusCode::OK);

        let query = Some("number=+15551112222&ring=ppe");
        let response = route(&state, &Method::POST, "/allowlist", query, b"").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            state.allowlist.ring_of("+15551112222"),
            Some(crate::allowlist::Ring::Prod)
        );
    }

    #[tokio::test]
    async fn test_allowlist_remove() {
        let state = state();
        state.allowlist.add("+15551112222", crate::allowlist::Ring::Prod).unwrap();

        let response = route(
            &state,
            &Method::DELETE,
            "/allowlist",
            Some("number=+15551112222"),
            b"",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["status"], "removed");
        assert!(state.allowlist.all().is_empty());

        let response = route(&state, &Method::DELETE, "/allowlist", None, b"").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_send_validation() {
        let state = state();

        let body = serde_json::json!({"phone_numbers": [], "message": "hi"}).to_string();
        let response = route(&state, &Method::POST, "/send", None, body.as_bytes()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = serde_json::json!({"phone_numbers": ["+15551112222"], "message": ""}).to_string();
        let response = route(&state, &Method::POST, "/send", None, body.as_bytes()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_send_gateway_failure_is_500() {
        let state = state(); // gateway port is closed

        let body =
            serde_json::json!({"phone_numbers": ["+15551112222"], "message": "hi"}).to_string();
        let response = route(&state, &Method::POST, "/send", None, body.as_bytes()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_health_unhealthy_gateway_is_503() {
        let state = state(); // gateway port is closed

        let response = route(&state, &Method::GET, "/health", None, b"").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let value = body_json(response).await;
        assert_eq!(value["status"], "unhealthy");
        assert_eq!(value["gateway"], "unhealthy");
        assert!(value["error"].as_str().is_some());
        assert_eq!(value["version"], VERSION);
    }

    #[tokio::test]
    async fn test_unknown_route_404() {
        let state = state();
        let response = route(&state, &Method::GET, "/nope", None, b"").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = route(&state, &Method::GET, "/allowlist/prod/extra", None, b"").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_query_param_decoding() {
        assert_eq!(
            query_param(Some("number=+15551112222&ring=prod"), "number").as_deref(),
            Some("+15551112222")
        );
        assert_eq!(
            query_param(Some("number=%2B15551112222"), "number").as_deref(),
            Some("+15551112222")
        );
        assert_eq!(query_param(Some("ring=prod"), "number"), None);
        assert_eq!(query_param(None, "number"), None);
    }

    #[test]
    fn test_phone_number_regex() {
        for ok in ["+15551112222", "15551112222", "1234567890", "+12345678901234"] {
            assert!(PHONE_NUMBER_RE.is_match(ok), "{} should match", ok);
        }
        for bad in ["", "abc", "+1555111", "123456789012345", "+1555111222x"] {
            assert!(!PHONE_NUMBER_RE.is_match(bad), "{} should not match", bad);
        }
    }

    #[tokio::test]
    async fn test_boundary_rejects_unexpected_local_ip() {
        // server whose private_ip can never equal a loopback local address
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = AdminServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            "10.255.255.1".parse().unwrap(),
            state(),
            shutdown_rx,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let response = reqwest::Client::new()
            .get(format!("http://{}/clients", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_boundary_allows_configured_local_ip() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = AdminServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            state(),
            shutdown_rx,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let response = reqwest::Client::new()
            .get(format!("http://{}/clients", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }
}
