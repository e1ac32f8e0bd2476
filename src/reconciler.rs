//! Webhook registration reconciliation
//!
//! The gateway's webhook set drifts: registrations disappear, and our ingress
//! port changes across restarts. A periodic tick re-establishes the invariant
//! that the gateway holds exactly one registration per event kind, each
//! pointing at the loopback ingress listener.

use crate::events::EventKind;
use crate::gateway::GatewayClient;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Reconciler {
    gateway: Arc<GatewayClient>,
    ingress_port: u16,
}

impl Reconciler {
    pub fn new(gateway: Arc<GatewayClient>, ingress_port: u16) -> Self {
        Self {
            gateway,
            ingress_port,
        }
    }

    /// The ingress URL the gateway must deliver `kind` events to
    pub fn expected_url(&self, kind: EventKind) -> String {
        format!(
            "http://127.0.0.1:{}/webhook/{}",
            self.ingress_port,
            kind.short()
        )
    }

    /// Startup variant: delete every pre-existing registration (the port may
    /// have changed since the last run), then register the full target set.
    /// Any failure here is fatal to startup.
    pub async fn install(&self) -> anyhow::Result<()> {
        let hooks = self.gateway.list_hooks().await?;
        for hook in hooks {
            info!(id = %hook.id, event = %hook.event, "Deleting existing webhook");
            self.gateway.delete_hook(&hook.id).await?;
        }

        for kind in EventKind::ALL {
            let url = self.expected_url(kind);
            info!(event = kind.wire(), url = %url, "Registering webhook");
            self.gateway.register_hook(kind.wire(), &url).await?;
        }

        info!("Webhook registration complete");
        Ok(())
    }

    /// One repair tick: delete entries whose URL is wrong, then re-register
    /// any event kind left uncovered. Individual delete/register failures are
    /// logged and the tick continues.
    pub async fn repair(&self) -> anyhow::Result<()> {
        let hooks = self.gateway.list_hooks().await?;

        let mut present: HashSet<EventKind> = HashSet::new();
        for hook in hooks {
            let matches = EventKind::from_wire(&hook.event)
                .filter(|kind| hook.url == self.expected_url(*kind));
            match matches {
                Some(kind) => {
                    present.insert(kind);
                }
                None => {
                    warn!(
                        id = %hook.id,
                        event = %hook.event,
                        url = %hook.url,
                        "Deleting stray webhook registration"
                    );
                    if let Err(e) = self.gateway.delete_hook(&hook.id).await {
                        warn!(id = %hook.id, error = %e, "Failed to delete stray webhook");
                    }
                }
            }
        }

        let mut repaired = 0;
        for kind in EventKind::ALL {
            if present.contains(&kind) {
                continue;
            }
            let url = self.expected_url(kind);
            warn!(event = kind.wire(), url = %url, "Webhook missing, re-registering");
            match self.gateway.register_hook(kind.wire(), &url).await {
                Ok(()) => repaired += 1,
                Err(e) => warn!(event = kind.wire(), error = %e, "Failed to re-register webhook"),
            }
        }

        if repaired > 0 {
            info!(repaired, "Repaired webhook registrations");
        }
        Ok(())
    }

    /// Shutdown variant: best-effort removal of every registration
    pub async fn cleanup(&self) {
        let hooks = match self.gateway.list_hooks().await {
            Ok(hooks) => hooks,
            Err(e) => {
                warn!(error = %e, "Failed to list webhooks during cleanup");
                return;
            }
        };

        for hook in hooks {
            info!(id = %hook.id, event = %hook.event, "Deleting webhook");
            if let Err(e) = self.gateway.delete_hook(&hook.id).await {
                warn!(id = %hook.id, error = %e, "Failed to delete webhook during cleanup");
            }
        }

        info!("Webhook cleanup complete");
    }
}

/// Periodic reconciliation; a tick in progress completes before shutdown
pub async fn run_reconciler(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = reconciler.repair().await {
                    warn!(error = %e, "Reconciliation tick failed, skipping");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
