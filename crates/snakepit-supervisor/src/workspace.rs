use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::SupervisorConfig;

const PY_SERVER: &str = include_str!("../assets/py/server.py");
const JS_SERVER: &str = include_str!("../assets/js/server.js");
const C_HOST: &str = include_str!("../assets/c/host.c");
const C_HEADER: &str = include_str!("../assets/c/battlesnake.h");

/// Working directory holding the per-language adapters:
///
/// ```text
/// <root>/py/server.py
/// <root>/js/server.js
/// <root>/c/{host.c, battlesnake.h, host}
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeWorkspace {
    root: PathBuf,
}

impl RuntimeWorkspace {
    /// Points at an existing layout without touching the filesystem.
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    /// Writes the bundled adapters and builds the native host.
    ///
    /// A failed host build is logged, not returned: Python and JS snakes still
    /// work, and C launches fail with `NativeHostUnavailable`.
    pub async fn prepare(config: &SupervisorConfig) -> anyhow::Result<Self> {
        let ws = Self::at(config.work_dir.clone());

        for (dir, files) in [
            (ws.root.join("py"), vec![("server.py", PY_SERVER)]),
            (ws.root.join("js"), vec![("server.js", JS_SERVER)]),
            (
                ws.c_dir(),
                vec![("host.c", C_HOST), ("battlesnake.h", C_HEADER)],
            ),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
            for (name, contents) in files {
                write_if_changed(&dir.join(name), contents).await?;
            }
        }

        if config.build_native_host {
            match ws.build_native_host(&config.cc).await {
                Ok(()) => {
                    tracing::info!(host = %ws.native_host().display(), "native host ready");
                }
                Err(err) => {
                    tracing::warn!(
                        err = format!("{err:#}"),
                        "native host build failed; C snakes will not start"
                    );
                }
            }
        }

        Ok(ws)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn py_adapter(&self) -> PathBuf {
        self.root.join("py").join("server.py")
    }

    pub fn js_adapter(&self) -> PathBuf {
        self.root.join("js").join("server.js")
    }

    pub fn c_dir(&self) -> PathBuf {
        self.root.join("c")
    }

    pub fn native_host(&self) -> PathBuf {
        self.c_dir().join("host")
    }

    async fn build_native_host(&self, cc: &str) -> anyhow::Result<()> {
        let src = self.c_dir().join("host.c");
        let out = tokio::process::Command::new(cc)
            .arg(&src)
            .arg(format!("-I{}", self.c_dir().display()))
            .arg("-o")
            .arg(self.native_host())
            .output()
            .await
            .with_context(|| format!("run `{cc}`"))?;
        if !out.status.success() {
            anyhow::bail!(
                "{cc} {} failed: {}",
                src.display(),
                crate::error::compiler_output(&out.stderr)
            );
        }
        Ok(())
    }
}

async fn write_if_changed(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Ok(existing) = tokio::fs::read_to_string(path).await
        && existing == contents
    {
        return Ok(());
    }
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("write {}", path.display()))
}
