use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Host (optionally `host:port`) advertised to clients in media URLs
    /// instead of the worker-local address. Leave unset for single-host
    /// deployments where workers bind a reachable address themselves.
    pub public_host: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
            public_host: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_jwt_expiry")]
    pub jwt_expiry_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
            jwt_expiry_seconds: default_jwt_expiry(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RendererConfig {
    /// Renderer binary launched once per session. Resolved against the
    /// server executable's directory and $PATH if not found as given.
    #[serde(default = "default_renderer_binary")]
    pub binary: String,
    /// Extra arguments passed before the per-session ones.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_heartbeat_grace")]
    pub heartbeat_grace_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_ms: u64,
    #[serde(default = "default_graceful_wait")]
    pub graceful_wait_secs: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            binary: default_renderer_binary(),
            args: Vec::new(),
            launch_timeout_secs: default_launch_timeout(),
            heartbeat_grace_secs: default_heartbeat_grace(),
            max_restarts: default_max_restarts(),
            restart_backoff_ms: default_restart_backoff(),
            graceful_wait_secs: default_graceful_wait(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Concurrent session ceiling for this node. Render workers are
    /// GPU-heavy; the default favors rejecting over oversubscribing.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_terminal_retention")]
    pub terminal_retention_secs: u64,
    #[serde(default = "default_control_queue_depth")]
    pub control_queue_depth: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            terminal_retention_secs: default_terminal_retention(),
            control_queue_depth: default_control_queue_depth(),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Generate a cryptographically random hex string of the given length.
fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 {
                b'0' + idx
            } else {
                b'a' + idx - 10
            })
        })
        .collect()
}

fn default_jwt_expiry() -> u64 {
    900
}
fn default_renderer_binary() -> String {
    "plinth-renderer".into()
}
fn default_launch_timeout() -> u64 {
    10
}
fn default_heartbeat_grace() -> u64 {
    15
}
fn default_max_restarts() -> u32 {
    3
}
fn default_restart_backoff() -> u64 {
    2000
}
fn default_graceful_wait() -> u64 {
    5
}
fn default_max_sessions() -> usize {
    8
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_terminal_retention() -> u64 {
    600
}
fn default_control_queue_depth() -> usize {
    64
}

fn looks_like_placeholder_secret(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return true;
    }
    normalized.contains("change_me")
        || normalized.contains("replace_me")
        || normalized.starts_with("example")
        || normalized == "secret"
}

fn validate_config(config: &Config) -> Result<()> {
    let jwt_secret = config.auth.jwt_secret.trim();
    if jwt_secret.len() < 32 || looks_like_placeholder_secret(jwt_secret) {
        anyhow::bail!(
            "Invalid auth.jwt_secret: use a strong random secret (at least 32 characters) and never leave placeholder values"
        );
    }
    if config.stream.max_sessions == 0 {
        anyhow::bail!("Invalid stream.max_sessions: must be at least 1");
    }
    if config.stream.control_queue_depth == 0 {
        anyhow::bail!("Invalid stream.control_queue_depth: must be at least 1");
    }
    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Plinth Server Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"
# Host (optionally host:port) advertised to clients in media URLs.
# public_host = "stream.example.com"

[auth]
# Must match the secret used by the upstream token issuer.
jwt_secret = "{jwt_secret}"
jwt_expiry_seconds = {jwt_expiry}

[renderer]
# Renderer binary launched once per streaming session.
# Resolved against the server executable's directory and $PATH.
binary = "{renderer_binary}"
# Extra arguments passed before the per-session ones.
# args = ["--gpu", "0"]
launch_timeout_secs = {launch_timeout}
heartbeat_grace_secs = {heartbeat_grace}
max_restarts = {max_restarts}
restart_backoff_ms = {restart_backoff}
graceful_wait_secs = {graceful_wait}

[stream]
# Concurrent session ceiling for this node.
max_sessions = {max_sessions}
# Sessions with no control traffic or status polls for this long are evicted.
idle_timeout_secs = {idle_timeout}
sweep_interval_secs = {sweep_interval}
# How long terminal session records are kept for late callers.
terminal_retention_secs = {terminal_retention}
control_queue_depth = {control_queue_depth}
"#,
        bind_address = config.server.bind_address,
        jwt_secret = config.auth.jwt_secret,
        jwt_expiry = config.auth.jwt_expiry_seconds,
        renderer_binary = config.renderer.binary,
        launch_timeout = config.renderer.launch_timeout_secs,
        heartbeat_grace = config.renderer.heartbeat_grace_secs,
        max_restarts = config.renderer.max_restarts,
        restart_backoff = config.renderer.restart_backoff_ms,
        graceful_wait = config.renderer.graceful_wait_secs,
        max_sessions = config.stream.max_sessions,
        idle_timeout = config.stream.idle_timeout_secs,
        sweep_interval = config.stream.sweep_interval_secs,
        terminal_retention = config.stream.terminal_retention_secs,
        control_queue_depth = config.stream.control_queue_depth,
    )
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("Config file not found at '{}', generating defaults...", path);
            let config = Config::default();

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, generate_config_template(&config))?;
            tracing::info!("Generated default config at '{}'", path);
            config
        };

        // Environment variable overrides
        if let Ok(value) = std::env::var("PLINTH_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("PLINTH_PUBLIC_HOST") {
            config.server.public_host = if value.trim().is_empty() {
                None
            } else {
                Some(value)
            };
        }
        if let Ok(value) = std::env::var("PLINTH_JWT_SECRET") {
            config.auth.jwt_secret = value;
        }
        if let Ok(value) = std::env::var("PLINTH_JWT_EXPIRY_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.auth.jwt_expiry_seconds = parsed;
            }
        }
        if let Ok(value) = std::env::var("PLINTH_RENDERER_BINARY") {
            config.renderer.binary = value;
        }
        if let Ok(value) = std::env::var("PLINTH_RENDERER_LAUNCH_TIMEOUT_SECS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.renderer.launch_timeout_secs = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("PLINTH_RENDERER_HEARTBEAT_GRACE_SECS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.renderer.heartbeat_grace_secs = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("PLINTH_RENDERER_MAX_RESTARTS") {
            if let Ok(parsed) = value.parse::<u32>() {
                config.renderer.max_restarts = parsed;
            }
        }
        if let Ok(value) = std::env::var("PLINTH_RENDERER_RESTART_BACKOFF_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.renderer.restart_backoff_ms = parsed;
            }
        }
        if let Ok(value) = std::env::var("PLINTH_RENDERER_GRACEFUL_WAIT_SECS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.renderer.graceful_wait_secs = parsed;
            }
        }
        if let Ok(value) = std::env::var("PLINTH_MAX_SESSIONS") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.stream.max_sessions = parsed.clamp(1, 1024);
            }
        }
        if let Ok(value) = std::env::var("PLINTH_IDLE_TIMEOUT_SECS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.stream.idle_timeout_secs = parsed.max(10);
            }
        }
        if let Ok(value) = std::env::var("PLINTH_SWEEP_INTERVAL_SECS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.stream.sweep_interval_secs = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("PLINTH_TERMINAL_RETENTION_SECS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.stream.terminal_retention_secs = parsed;
            }
        }
        if let Ok(value) = std::env::var("PLINTH_CONTROL_QUEUE_DEPTH") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.stream.control_queue_depth = parsed.clamp(1, 4096);
            }
        }

        validate_config(&config)?;
        Ok(config)
    }
}
