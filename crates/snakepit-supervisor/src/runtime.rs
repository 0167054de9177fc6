use std::path::{Path, PathBuf};

use snakepit_worker::RuntimeKind;

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::workspace::RuntimeWorkspace;

/// How an artifact becomes a running worker. Selected once from the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStrategy {
    /// `node <adapter> <artifact> <port>`
    InterpretedScript,
    /// `python3 <adapter> <artifact> <port>` with stdout buffering disabled.
    InterpretedScriptUnbuffered,
    /// Compile to a shared object, then preload it into the native host.
    CompiledNative,
}

/// Compile step run before spawning (native strategy only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileStep {
    pub program: String,
    pub args: Vec<String>,
    pub output: PathBuf,
}

/// Everything needed to spawn one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub compile: Option<CompileStep>,
}

impl RuntimeStrategy {
    /// Accepts `.py`, `py`, `PY` and so on.
    pub fn from_language_tag(tag: &str) -> Result<Self, SupervisorError> {
        let normalized = tag.trim().trim_start_matches('.').to_ascii_lowercase();
        match normalized.as_str() {
            "js" => Ok(RuntimeStrategy::InterpretedScript),
            "py" => Ok(RuntimeStrategy::InterpretedScriptUnbuffered),
            "c" => Ok(RuntimeStrategy::CompiledNative),
            _ => Err(SupervisorError::UnsupportedLanguage(tag.to_string())),
        }
    }

    /// Picks the strategy for `artifact` tagged `tag`. A tag that names a
    /// different language than a recognised extension is rejected.
    pub fn resolve(artifact: &Path, tag: &str) -> Result<Self, SupervisorError> {
        let strategy = Self::from_language_tag(tag)?;
        if let Ok(by_path) = Self::from_artifact_path(artifact)
            && by_path != strategy
        {
            return Err(SupervisorError::LanguageMismatch {
                tag: tag.to_string(),
                path: artifact.to_path_buf(),
            });
        }
        Ok(strategy)
    }

    pub fn from_artifact_path(path: &Path) -> Result<Self, SupervisorError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| SupervisorError::UnsupportedLanguage(path.display().to_string()))?;
        Self::from_language_tag(ext)
    }

    pub fn kind(self) -> RuntimeKind {
        match self {
            RuntimeStrategy::InterpretedScript => RuntimeKind::Node,
            RuntimeStrategy::InterpretedScriptUnbuffered => RuntimeKind::Python,
            RuntimeStrategy::CompiledNative => RuntimeKind::Native,
        }
    }

    pub fn plan(
        self,
        config: &SupervisorConfig,
        workspace: &RuntimeWorkspace,
        artifact: &Path,
        port: u16,
    ) -> LaunchPlan {
        let artifact_arg = artifact.display().to_string();
        let port_arg = port.to_string();

        match self {
            RuntimeStrategy::InterpretedScript => LaunchPlan {
                program: config.node.clone(),
                args: vec![
                    workspace.js_adapter().display().to_string(),
                    artifact_arg,
                    port_arg,
                ],
                env: Vec::new(),
                compile: None,
            },
            RuntimeStrategy::InterpretedScriptUnbuffered => LaunchPlan {
                program: config.python.clone(),
                args: vec![
                    workspace.py_adapter().display().to_string(),
                    artifact_arg,
                    port_arg,
                ],
                env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
                compile: None,
            },
            RuntimeStrategy::CompiledNative => {
                let module = native_module_path(artifact);
                LaunchPlan {
                    program: workspace.native_host().display().to_string(),
                    args: vec![port_arg],
                    env: vec![("LD_PRELOAD".to_string(), module.display().to_string())],
                    compile: Some(CompileStep {
                        program: config.cc.clone(),
                        args: vec![
                            "-shared".to_string(),
                            "-fPIC".to_string(),
                            format!("-I{}", workspace.c_dir().display()),
                            "-o".to_string(),
                            module.display().to_string(),
                            artifact_arg,
                        ],
                        output: module,
                    }),
                }
            }
        }
    }
}

/// `agents/3/snake.c` -> `agents/3/snake.so`
pub fn native_module_path(artifact: &Path) -> PathBuf {
    artifact.with_extension("so")
}
