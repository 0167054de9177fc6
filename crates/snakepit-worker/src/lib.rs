use std::fmt;

use specta::Type;

/// Identity of an agent record, owned by the persistence layer.
///
/// NOTE: The supervisor only uses this as a key; it never interprets the value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(transparent)]
pub struct AgentId(pub i64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AgentId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

/// Liveness as observed by the last probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Online => "online",
            WorkerStatus::Offline => "offline",
        }
    }
}

/// Which runtime hosts the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Node,
    Python,
    Native,
}

/// Read-only snapshot of a managed worker.
///
/// This is what callers (match setup, admin views) get back; process and log
/// handles stay inside the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct WorkerInfo {
    pub agent_id: AgentId,
    pub base_url: String,
    pub port: u16,
    pub artifact_path: String,
    pub runtime: RuntimeKind,
    pub pid: Option<u32>,
    pub log_path: String,
    pub started_at_unix_ms: u64,
}
