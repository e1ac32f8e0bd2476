//! Loopback ingress listener for gateway webhooks
//!
//! Bound to 127.0.0.1 on an OS-assigned port; the reconciler registers that
//! port with the gateway. Only the four `POST /webhook/{kind}` routes exist.
//! The gateway gets its 200 before fan-out starts, so delivery latency and
//! retries never show up in the gateway's view of us.

use crate::error::response;
use crate::events::EventKind;
use crate::fanout::{FanoutEngine, Prepared};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct IngressServer {
    listener: TcpListener,
    engine: Arc<FanoutEngine>,
    shutdown_rx: watch::Receiver<bool>,
}

impl IngressServer {
    /// Bind the loopback listener on an ephemeral port
    pub async fn bind(
        engine: Arc<FanoutEngine>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        Ok(Self {
            listener,
            engine,
            shutdown_rx,
        })
    }

    /// The port the OS picked; this is what gets registered with the gateway
    pub fn port(&self) -> anyhow::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "Ingress listener ready");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let engine = Arc::clone(&self.engine);
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let engine = Arc::clone(&engine);
                                    async move {
                                        Ok::<_, std::convert::Infallible>(handle_request(req, engine).await)
                                    }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Ingress connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept ingress connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Ingress listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    engine: Arc<FanoutEngine>,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let kind = match path.strip_prefix("/webhook/").and_then(EventKind::from_short) {
        Some(kind) if method == Method::POST => kind,
        _ => return response(StatusCode::NOT_FOUND, "not found"),
    };

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(kind = %kind, error = %e, "Failed to read webhook body");
            return response(StatusCode::BAD_REQUEST, "failed to read body");
        }
    };

    match engine.prepare(kind, &body) {
        Err(e) => {
            let fragment: String = String::from_utf8_lossy(&body).chars().take(200).collect();
            warn!(kind = %kind, error = %e, body = %fragment, "Rejecting webhook");
            response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Ok(Prepared::Duplicate) => response(StatusCode::OK, "OK"),
        Ok(Prepared::Forward(event)) => {
            // acknowledge first; delivery happens off this request
            tokio::spawn(async move {
                engine.dispatch(&event, body).await;
            });
            response(StatusCode::OK, "OK")
        }
    }
}
