use std::path::PathBuf;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;
const MAX_COMPILER_OUTPUT_BYTES: usize = 4 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("compiling {path} failed: {output}")]
    CompileFailed { path: PathBuf, output: String },

    #[error("could not run compiler `{program}`")]
    CompilerUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("native host binary is not available at {0}")]
    NativeHostUnavailable(PathBuf),

    #[error("failed to open log file {path}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start `{program}`")]
    StartFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker exited during startup ({status})")]
    ExitedEarly { status: String },

    #[error("worker did not open port {port} within {timeout_ms}ms")]
    NotReady { port: u16, timeout_ms: u128 },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no available ports in {base}..{end}")]
    PortsExhausted { base: u16, end: u32 },

    #[error("unsupported language: {0:?}")]
    UnsupportedLanguage(String),

    #[error("language {tag:?} does not match artifact {path}")]
    LanguageMismatch { tag: String, path: PathBuf },

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("supervisor is closed")]
    Closed,
}

impl SupervisorError {
    /// Stable machine-readable code, used by the admin API.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::PortsExhausted { .. } => "ports_exhausted",
            SupervisorError::UnsupportedLanguage(_) => "unsupported_language",
            SupervisorError::LanguageMismatch { .. } => "language_mismatch",
            SupervisorError::Closed => "closed",
            SupervisorError::Launch(e) => match e {
                LaunchError::CompileFailed { .. } => "compile_failed",
                LaunchError::CompilerUnavailable { .. } => "compiler_unavailable",
                LaunchError::NativeHostUnavailable(_) => "native_host_unavailable",
                LaunchError::LogFile { .. } => "log_file",
                LaunchError::StartFailed { .. } | LaunchError::ExitedEarly { .. } => {
                    "start_failed"
                }
                LaunchError::NotReady { .. } => "not_ready",
            },
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SupervisorError::PortsExhausted { .. } => {
                Some("Stop and remove an idle snake, then try again.")
            }
            SupervisorError::UnsupportedLanguage(_) => {
                Some("Upload a .py, .js or .c file.")
            }
            SupervisorError::LanguageMismatch { .. } => {
                Some("Omit the language or make it match the file extension.")
            }
            SupervisorError::Launch(LaunchError::CompileFailed { .. }) => {
                Some("Fix the compiler errors and upload the snake again.")
            }
            SupervisorError::Launch(LaunchError::ExitedEarly { .. })
            | SupervisorError::Launch(LaunchError::NotReady { .. }) => {
                Some("Check the snake log file for errors.")
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<&SupervisorError> for ErrorPayload {
    fn from(err: &SupervisorError) -> Self {
        Self {
            code: err.code().to_string(),
            message: truncate_utf8(
                &crate::config::format_error_chain(err),
                MAX_MESSAGE_BYTES,
            ),
            hint: err.hint().map(|h| truncate_utf8(h, MAX_HINT_BYTES)),
        }
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub(crate) fn compiler_output(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "compiler exited with an error".to_string();
    }
    truncate_utf8(trimmed, MAX_COMPILER_OUTPUT_BYTES)
}
