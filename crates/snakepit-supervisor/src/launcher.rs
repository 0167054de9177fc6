use std::{
    io::Write,
    path::Path,
    process::Stdio,
    time::Duration,
};

use snakepit_worker::AgentId;
use tokio::process::Command;

use crate::config::SupervisorConfig;
use crate::error::{LaunchError, compiler_output};
use crate::process_table::{WorkerHandle, WorkerProcess, WorkerRecord};
use crate::runtime::{CompileStep, LaunchPlan, RuntimeStrategy};
use crate::workspace::RuntimeWorkspace;

const READY_BACKOFF_START: Duration = Duration::from_millis(50);
const READY_BACKOFF_MAX: Duration = Duration::from_millis(500);

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies, take the worker down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Appends a supervisor line to a worker log. Best-effort.
fn banner(file: &mut std::fs::File, line: impl AsRef<str>) {
    let _ = writeln!(file, "[snakepit] {}", line.as_ref());
}

async fn local_port_open(port: u16) -> bool {
    tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_ok()
}

/// Turns an artifact into a running worker process.
#[derive(Debug, Clone)]
pub struct Launcher {
    config: SupervisorConfig,
    workspace: RuntimeWorkspace,
}

impl Launcher {
    pub fn new(config: SupervisorConfig, workspace: RuntimeWorkspace) -> Self {
        Self { config, workspace }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    #[tracing::instrument(skip(self, artifact), fields(artifact = %artifact.display()))]
    pub async fn launch(
        &self,
        agent_id: AgentId,
        artifact: &Path,
        strategy: RuntimeStrategy,
        port: u16,
        generation: u64,
    ) -> Result<WorkerRecord, LaunchError> {
        let plan = strategy.plan(&self.config, &self.workspace, artifact, port);

        if let Some(step) = &plan.compile {
            let host = self.workspace.native_host();
            if !host.is_file() {
                return Err(LaunchError::NativeHostUnavailable(host));
            }
            compile(step, artifact).await?;
        }

        let log_path = self.config.log_path(agent_id);
        let mut log_file = open_log(&log_path)?;
        banner(
            &mut log_file,
            format!(
                "start requested: agent_id={agent_id} port={port} exec={} {}",
                plan.program,
                plan.args.join(" ")
            ),
        );

        let child = match spawn(&plan, &log_file) {
            Ok(c) => c,
            Err(source) => {
                banner(&mut log_file, format!("spawn failed: {source}"));
                return Err(LaunchError::StartFailed {
                    program: plan.program.clone(),
                    source,
                });
            }
        };

        let mut process = WorkerProcess::new(child);
        tracing::info!(pid = ?process.pid(), port, "worker spawned");

        if let Err(err) = self.wait_until_ready(&mut process, port).await {
            banner(&mut log_file, format!("startup failed: {err}"));
            if let Err(e) = process.terminate().await {
                tracing::warn!(err = %e, "failed to reap worker after startup failure");
            }
            return Err(err);
        }
        banner(&mut log_file, format!("worker accepting connections on port {port}"));

        Ok(WorkerRecord {
            agent_id,
            base_url: format!("http://localhost:{port}"),
            artifact_path: artifact.to_path_buf(),
            port,
            runtime: strategy.kind(),
            generation,
            started_at_unix_ms: now_unix_ms(),
            log_path,
            process: WorkerHandle::new(process),
            log_file,
        })
    }

    async fn wait_until_ready(
        &self,
        process: &mut WorkerProcess,
        port: u16,
    ) -> Result<(), LaunchError> {
        let timeout = self.config.ready_timeout;
        if timeout.is_zero() {
            tokio::time::sleep(self.config.start_grace).await;
            return match process.try_exit_status() {
                Some(status) => Err(LaunchError::ExitedEarly {
                    status: status.to_string(),
                }),
                None => Ok(()),
            };
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = READY_BACKOFF_START;
        loop {
            if let Some(status) = process.try_exit_status() {
                return Err(LaunchError::ExitedEarly {
                    status: status.to_string(),
                });
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(LaunchError::NotReady {
                    port,
                    timeout_ms: timeout.as_millis(),
                });
            }

            if local_port_open(port).await {
                // The port might belong to someone else; make sure our child is
                // still the one standing.
                return match process.try_exit_status() {
                    Some(status) => Err(LaunchError::ExitedEarly {
                        status: status.to_string(),
                    }),
                    None => Ok(()),
                };
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(READY_BACKOFF_MAX);
        }
    }
}

async fn compile(step: &CompileStep, artifact: &Path) -> Result<(), LaunchError> {
    tracing::info!(output = %step.output.display(), "compiling native snake");
    let out = Command::new(&step.program)
        .args(&step.args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| LaunchError::CompilerUnavailable {
            program: step.program.clone(),
            source,
        })?;

    if !out.status.success() {
        let output = compiler_output(&out.stderr);
        tracing::warn!(%output, "native snake failed to compile");
        return Err(LaunchError::CompileFailed {
            path: artifact.to_path_buf(),
            output,
        });
    }
    Ok(())
}

fn open_log(path: &Path) -> Result<std::fs::File, LaunchError> {
    let open = || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
    };
    open().map_err(|source| LaunchError::LogFile {
        path: path.to_path_buf(),
        source,
    })
}

fn spawn(plan: &LaunchPlan, log_file: &std::fs::File) -> std::io::Result<tokio::process::Child> {
    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args)
        .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file.try_clone()?))
        .stderr(Stdio::from(log_file.try_clone()?))
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    cmd.spawn()
}
