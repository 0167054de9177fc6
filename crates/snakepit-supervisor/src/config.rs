use std::{net::SocketAddr, path::PathBuf, time::Duration};

const DEFAULT_BASE_PORT: u16 = 8000;
const DEFAULT_MAX_PORTS: u16 = 300;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;
const DEFAULT_START_GRACE_MS: u64 = 300;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u16>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_path(name: &str, default: &str) -> PathBuf {
    let raw = env_string(name).unwrap_or_else(|| default.to_string());
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    }
}

/// Base port is kept out of the privileged range; the count is clamped so the
/// range stays within `u16` but always holds at least one port.
fn port_range(base: Option<u16>, max: Option<u16>) -> (u16, u16) {
    let base = base.map(|v| v.max(1024)).unwrap_or(DEFAULT_BASE_PORT);
    let room = (u16::MAX - base).saturating_add(1);
    let max = max.unwrap_or(DEFAULT_MAX_PORTS).clamp(1, room);
    (base, max)
}

/// Runtime knobs for the supervisor.
///
/// Everything can be set through `SNAKEPIT_*` environment variables; out of
/// range values are clamped rather than rejected.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Holds the adapter scripts and the native host binary.
    pub work_dir: PathBuf,
    /// Per-agent log files (`snake-<id>.log`) land here.
    pub log_dir: PathBuf,
    pub base_port: u16,
    pub max_ports: u16,
    pub probe_timeout: Duration,
    /// Zero disables readiness polling and falls back to `start_grace`.
    pub ready_timeout: Duration,
    pub start_grace: Duration,
    pub python: String,
    pub node: String,
    pub cc: String,
    /// Build the native host while preparing the work dir.
    pub build_native_host: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("servers"),
            log_dir: PathBuf::from("."),
            base_port: DEFAULT_BASE_PORT,
            max_ports: DEFAULT_MAX_PORTS,
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            ready_timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
            start_grace: Duration::from_millis(DEFAULT_START_GRACE_MS),
            python: "python3".to_string(),
            node: "node".to_string(),
            cc: "gcc".to_string(),
            build_native_host: true,
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let (base_port, max_ports) = port_range(
            env_u16("SNAKEPIT_BASE_PORT"),
            env_u16("SNAKEPIT_MAX_PORTS"),
        );

        Self {
            work_dir: env_path("SNAKEPIT_WORK_DIR", "./servers"),
            log_dir: env_path("SNAKEPIT_LOG_DIR", "."),
            base_port,
            max_ports,
            probe_timeout: Duration::from_millis(
                env_u64("SNAKEPIT_PROBE_TIMEOUT_MS")
                    .map(|v| v.clamp(100, 60_000))
                    .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
            ),
            ready_timeout: Duration::from_millis(
                env_u64("SNAKEPIT_READY_TIMEOUT_MS")
                    .map(|v| v.min(120_000))
                    .unwrap_or(DEFAULT_READY_TIMEOUT_MS),
            ),
            start_grace: Duration::from_millis(
                env_u64("SNAKEPIT_START_GRACE_MS")
                    .map(|v| v.min(10_000))
                    .unwrap_or(DEFAULT_START_GRACE_MS),
            ),
            python: env_string("SNAKEPIT_PYTHON").unwrap_or(d.python),
            node: env_string("SNAKEPIT_NODE").unwrap_or(d.node),
            cc: env_string("SNAKEPIT_CC").unwrap_or(d.cc),
            build_native_host: env_string("SNAKEPIT_BUILD_NATIVE_HOST").is_none_or(|v| {
                !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off")
            }),
        }
    }

    pub fn log_path(&self, agent_id: snakepit_worker::AgentId) -> PathBuf {
        self.log_dir.join(format!("snake-{agent_id}.log"))
    }
}

pub fn listen_addr() -> anyhow::Result<SocketAddr> {
    let raw = env_string("SNAKEPIT_LISTEN").unwrap_or_else(|| "127.0.0.1:8090".to_string());
    raw.parse()
        .map_err(|e| anyhow::anyhow!("invalid SNAKEPIT_LISTEN {raw:?}: {e}"))
}

pub(crate) fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = Vec::<String>::new();
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        let s = e.to_string();
        if !s.is_empty() && parts.last() != Some(&s) {
            parts.push(s);
        }
        cur = e.source();
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
