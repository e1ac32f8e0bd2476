use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
///
/// `port` and `private_ip` have no defaults and are fatal when missing.
/// The gateway basic-auth password may be given inline or via `password_file`.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Port for the admin API listener (bound on 0.0.0.0)
    pub port: u16,

    /// Local IP the admin API must be reached on; anything else gets 403
    pub private_ip: String,

    /// Gateway basic-auth password (inline)
    pub password: Option<String>,

    /// Path to a file holding the gateway basic-auth password
    pub password_file: Option<String>,

    /// Path to the allowlist SQLite database
    #[serde(default = "default_allowlist_db")]
    pub allowlist_db: String,

    /// Gateway connection settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Subscriber forwarding settings
    #[serde(default)]
    pub forward: ForwardConfig,

    /// Duplicate-suppression settings
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Webhook reconciliation settings
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Subscriber registry settings
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Host to reach the gateway on. When unset, a non-loopback local IPv4
    /// address is discovered at startup.
    pub host: Option<String>,

    /// Gateway port (default: 8080)
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Gateway basic-auth username (default: "sms")
    #[serde(default = "default_gateway_username")]
    pub username: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_gateway_port(),
            username: default_gateway_username(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForwardConfig {
    /// Attempts per subscriber per event (default: 3)
    #[serde(default = "default_forward_attempts")]
    pub attempts: u32,

    /// Fixed wait between attempts in seconds (default: 1)
    #[serde(default = "default_forward_retry_delay")]
    pub retry_delay_secs: u64,
}

impl ForwardConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            attempts: default_forward_attempts(),
            retry_delay_secs: default_forward_retry_delay(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    /// How long a (kind, message id) pair suppresses duplicates, in seconds.
    /// Must exceed the gateway's redelivery window (default: 300)
    #[serde(default = "default_dedup_ttl")]
    pub ttl_secs: u64,

    /// Sweep interval for expired entries in seconds (default: 60)
    #[serde(default = "default_dedup_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_dedup_ttl(),
            sweep_interval_secs: default_dedup_sweep_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    /// Interval between reconciliation ticks in seconds (default: 30)
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Seconds since last heartbeat before a subscriber is pruned (default: 60)
    #[serde(default = "default_registry_ttl")]
    pub ttl_secs: u64,

    /// Pruner interval in seconds (default: 10)
    #[serde(default = "default_registry_prune_interval")]
    pub prune_interval_secs: u64,
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_registry_ttl(),
            prune_interval_secs: default_registry_prune_interval(),
        }
    }
}

fn default_allowlist_db() -> String {
    "allowlist.db".to_string()
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_username() -> String {
    "sms".to_string()
}

fn default_forward_attempts() -> u32 {
    3
}

fn default_forward_retry_delay() -> u64 {
    1
}

fn default_dedup_ttl() -> u64 {
    300 // must outlast the gateway's redelivery window
}

fn default_dedup_sweep_interval() -> u64 {
    60
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_registry_ttl() -> u64 {
    60
}

fn default_registry_prune_interval() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be non-zero");
        }

        self.private_ip
            .parse::<IpAddr>()
            .map_err(|e| anyhow::anyhow!("invalid private_ip '{}': {}", self.private_ip, e))?;

        if self.password.is_none() && self.password_file.is_none() {
            anyhow::bail!("either password or password_file must be set");
        }

        if self.forward.attempts == 0 {
            anyhow::bail!("forward.attempts must be at least 1");
        }

        Ok(())
    }

    /// The local IP the admin API must be reached on
    pub fn private_ip(&self) -> IpAddr {
        self.private_ip.parse().expect("validated at load time")
    }

    /// Resolve the gateway password: inline value wins, else the file
    pub fn resolve_password(&self) -> anyhow::Result<String> {
        if let Some(ref password) = self.password {
            return Ok(password.clone());
        }

        let path = self
            .password_file
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no password or password_file configured"))?;

        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read password file {}: {}", path, e))?;

        let password = raw.trim();
        if password.is_empty() {
            anyhow::bail!("password file {} is empty", path);
        }

        Ok(password.to_string())
    }
}
