use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, PoisonError},
};

use snakepit_worker::{AgentId, WorkerInfo, WorkerStatus};
use tokio::sync::{Mutex, RwLock};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::launcher::Launcher;
use crate::port_alloc::PortAllocator;
use crate::process_table::ProcessTable;
use crate::prober::HealthProber;
use crate::runtime::RuntimeStrategy;
use crate::workspace::RuntimeWorkspace;

struct Inner {
    table: Arc<ProcessTable>,
    launcher: Launcher,
    prober: HealthProber,
    // Serialises manage/remove per agent so a check-then-launch can't race.
    launch_locks: std::sync::Mutex<HashMap<AgentId, Arc<Mutex<()>>>>,
    // `true` once closed. Launches hold the read side for their whole run.
    closed: RwLock<bool>,
}

/// Starts, tracks and tears down one worker process per agent.
///
/// Cheap to clone; all clones share the same state. Call [`Supervisor::close`]
/// before exiting to kill every worker.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("managed", &self.inner.table.len())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Prepares the runtime work dir, then builds the supervisor.
    pub async fn new(config: SupervisorConfig) -> anyhow::Result<Self> {
        let workspace = RuntimeWorkspace::prepare(&config).await?;
        Self::with_workspace(config, workspace)
    }

    pub fn with_workspace(
        config: SupervisorConfig,
        workspace: RuntimeWorkspace,
    ) -> anyhow::Result<Self> {
        let ports = Arc::new(PortAllocator::new(config.base_port, config.max_ports));
        let table = Arc::new(ProcessTable::new(ports));
        let prober = HealthProber::new(table.clone(), config.probe_timeout)?;
        tracing::info!(
            base_port = config.base_port,
            max_ports = config.max_ports,
            work_dir = %workspace.root().display(),
            "supervisor ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                table,
                launcher: Launcher::new(config, workspace),
                prober,
                launch_locks: std::sync::Mutex::new(HashMap::new()),
                closed: RwLock::new(false),
            }),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        self.inner.launcher.config()
    }

    pub fn ports(&self) -> &PortAllocator {
        self.inner.table.ports()
    }

    fn lock_for(&self, id: AgentId) -> Arc<Mutex<()>> {
        let mut map = self
            .inner
            .launch_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ensures a worker runs for `id`. Never restarts an existing one, even if
    /// it is unhealthy.
    pub async fn manage(
        &self,
        id: AgentId,
        artifact: impl AsRef<Path>,
        language: &str,
    ) -> Result<(), SupervisorError> {
        let strategy = RuntimeStrategy::resolve(artifact.as_ref(), language)?;
        let closed = self.inner.closed.read().await;
        if *closed {
            return Err(SupervisorError::Closed);
        }

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.manage_locked(id, artifact.as_ref(), strategy).await?;
        Ok(())
    }

    async fn manage_locked(
        &self,
        id: AgentId,
        artifact: &Path,
        strategy: RuntimeStrategy,
    ) -> Result<WorkerInfo, SupervisorError> {
        let table = &self.inner.table;
        if let Some(info) = table.get(id) {
            tracing::debug!(agent_id = %id, port = info.port, "snake already managed");
            return Ok(info);
        }

        let port = table.ports().acquire()?;
        let generation = table.next_generation();
        tracing::info!(agent_id = %id, port, artifact = %artifact.display(), "starting snake");

        let record = match self
            .inner
            .launcher
            .launch(id, artifact, strategy, port, generation)
            .await
        {
            Ok(r) => r,
            Err(err) => {
                table.ports().release(port);
                tracing::warn!(agent_id = %id, port, %err, "snake failed to start");
                return Err(err.into());
            }
        };

        let info = record.info();
        table.put(record);
        tracing::info!(agent_id = %id, port, pid = ?info.pid, "snake started");
        Ok(info)
    }

    /// Kills the worker and waits for it to exit. The record and its port are
    /// kept; use [`Supervisor::stop_and_remove`] to forget it.
    pub async fn stop(&self, id: AgentId) {
        let Some(handle) = self.inner.table.handle(id) else {
            tracing::info!(agent_id = %id, "stop: snake not managed");
            return;
        };
        match handle.terminate().await {
            Ok(status) => tracing::info!(agent_id = %id, %status, "snake stopped"),
            Err(err) => tracing::warn!(agent_id = %id, %err, "failed to wait for snake"),
        }
    }

    pub async fn stop_and_remove(&self, id: AgentId) {
        {
            let lock = self.lock_for(id);
            let _guard = lock.lock().await;
            self.stop_and_remove_locked(id).await;
        }
        self.prune_lock(id);
    }

    /// Forgets the launch lock for `id` unless someone holds or awaits it.
    /// Clones are only handed out under the map mutex, so the count is exact.
    fn prune_lock(&self, id: AgentId) {
        let mut map = self
            .inner
            .launch_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if map.get(&id).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(&id);
        }
    }

    async fn stop_and_remove_locked(&self, id: AgentId) {
        self.stop(id).await;
        self.inner.table.remove(id);
    }

    /// Probes the worker; an unreachable one is evicted.
    pub async fn get_status(&self, id: AgentId) -> WorkerStatus {
        self.inner.prober.probe(id).await
    }

    pub fn get_server(&self, id: AgentId) -> Option<WorkerInfo> {
        self.inner.table.get(id)
    }

    pub fn list(&self) -> Vec<WorkerInfo> {
        self.inner.table.list()
    }

    /// Replaces whatever runs for `id` with a fresh worker.
    pub async fn rerun(
        &self,
        id: AgentId,
        artifact: impl AsRef<Path>,
        language: &str,
    ) -> Result<WorkerInfo, SupervisorError> {
        let strategy = RuntimeStrategy::resolve(artifact.as_ref(), language)?;
        let closed = self.inner.closed.read().await;
        if *closed {
            return Err(SupervisorError::Closed);
        }

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.stop_and_remove_locked(id).await;
        self.manage_locked(id, artifact.as_ref(), strategy).await
    }

    /// Returns the running worker, starting one first if needed.
    pub async fn ensure_running(
        &self,
        id: AgentId,
        artifact: impl AsRef<Path>,
        language: &str,
    ) -> Result<WorkerInfo, SupervisorError> {
        if let Some(info) = self.get_server(id) {
            return Ok(info);
        }
        let strategy = RuntimeStrategy::resolve(artifact.as_ref(), language)?;
        let closed = self.inner.closed.read().await;
        if *closed {
            return Err(SupervisorError::Closed);
        }

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.manage_locked(id, artifact.as_ref(), strategy).await
    }

    pub async fn is_closed(&self) -> bool {
        *self.inner.closed.read().await
    }

    /// Kills and reaps every worker. Idempotent.
    ///
    /// Waits for in-flight launches to finish first. Ports are not released;
    /// the table is simply emptied.
    pub async fn close(&self) {
        let mut closed = self.inner.closed.write().await;
        if *closed {
            return;
        }
        *closed = true;

        let records = self.inner.table.drain();
        let count = records.len();
        for record in records {
            if let Err(err) = record.process.terminate().await {
                tracing::warn!(agent_id = %record.agent_id, %err, "failed to reap snake on close");
            }
        }
        tracing::info!(count, "supervisor closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        call_worker, command_available, fake_workspace, free_port, temp_dir_for, test_config,
    };

    async fn supervisor(name: &str, adapter: &str) -> (Supervisor, std::path::PathBuf) {
        let dir = temp_dir_for(name);
        let cfg = test_config(&dir);
        let ws = fake_workspace(&cfg, adapter).await;
        (Supervisor::with_workspace(cfg, ws).unwrap(), dir)
    }

    #[tokio::test]
    async fn end_to_end_ports_are_first_fit_and_reused() {
        let (sup, dir) = supervisor("sup-e2e", "exec sleep 30").await;

        sup.manage(AgentId(7), "agents/7/snake.py", ".py").await.unwrap();
        assert_eq!(
            sup.get_server(AgentId(7)).unwrap().base_url,
            "http://localhost:8000"
        );

        sup.manage(AgentId(8), "agents/8/snake.js", ".js").await.unwrap();
        assert_eq!(
            sup.get_server(AgentId(8)).unwrap().base_url,
            "http://localhost:8001"
        );

        sup.stop_and_remove(AgentId(7)).await;
        assert!(sup.get_server(AgentId(7)).is_none());
        assert!(!sup.ports().is_reserved(8000));

        sup.manage(AgentId(9), "agents/9/snake.py", ".py").await.unwrap();
        assert_eq!(sup.get_server(AgentId(9)).unwrap().port, 8000);

        sup.close().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn manage_is_idempotent() {
        let (sup, dir) = supervisor("sup-idem", "exec sleep 30").await;

        sup.manage(AgentId(1), "agents/1/snake.py", "py").await.unwrap();
        let first = sup.get_server(AgentId(1)).unwrap();
        sup.manage(AgentId(1), "agents/1/snake.py", "py").await.unwrap();
        let second = sup.get_server(AgentId(1)).unwrap();

        assert_eq!(first, second);
        assert_eq!(sup.ports().reserved_count(), 1);
        sup.close().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn concurrent_manage_for_same_agent_launches_once() {
        let (sup, dir) = supervisor("sup-race", "exec sleep 30").await;

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let sup = sup.clone();
                tokio::spawn(async move {
                    sup.manage(AgentId(5), "agents/5/snake.js", ".js").await
                })
            })
            .collect();
        for c in calls {
            c.await.unwrap().unwrap();
        }

        assert_eq!(sup.list().len(), 1);
        assert_eq!(sup.ports().reserved_count(), 1);
        sup.close().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unsupported_language_leaves_state_untouched() {
        let (sup, dir) = supervisor("sup-rb", "exec sleep 30").await;

        let err = sup
            .manage(AgentId(10), "agents/10/snake.rb", ".rb")
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::UnsupportedLanguage(_)));
        assert!(sup.list().is_empty());
        assert_eq!(sup.ports().reserved_count(), 0);
        assert!(!sup.config().log_path(AgentId(10)).exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn failed_launch_releases_its_port() {
        let dir = temp_dir_for("sup-fail");
        let cfg = SupervisorConfig {
            start_grace: std::time::Duration::from_millis(500),
            ..test_config(&dir)
        };
        let ws = fake_workspace(&cfg, "exit 1").await;
        let sup = Supervisor::with_workspace(cfg, ws).unwrap();

        let err = sup
            .manage(AgentId(3), "agents/3/snake.py", ".py")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "start_failed");
        assert!(sup.get_server(AgentId(3)).is_none());
        assert_eq!(sup.ports().reserved_count(), 0);
        // The log stays for postmortem.
        assert!(sup.config().log_path(AgentId(3)).is_file());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn exhausted_range_is_reported() {
        let dir = temp_dir_for("sup-exhausted");
        let cfg = SupervisorConfig {
            max_ports: 1,
            ..test_config(&dir)
        };
        let ws = fake_workspace(&cfg, "exec sleep 30").await;
        let sup = Supervisor::with_workspace(cfg, ws).unwrap();

        sup.manage(AgentId(1), "a/1/snake.py", ".py").await.unwrap();
        let err = sup.manage(AgentId(2), "a/2/snake.py", ".py").await.unwrap_err();
        assert!(matches!(err, SupervisorError::PortsExhausted { .. }));

        sup.stop_and_remove(AgentId(1)).await;
        sup.manage(AgentId(2), "a/2/snake.py", ".py").await.unwrap();
        sup.close().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn stop_pauses_without_releasing_port() {
        // The status check below must find nothing listening on the port.
        let dir = temp_dir_for("sup-stop");
        let cfg = SupervisorConfig {
            base_port: free_port(),
            max_ports: 1,
            ..test_config(&dir)
        };
        let ws = fake_workspace(&cfg, "exec sleep 30").await;
        let sup = Supervisor::with_workspace(cfg, ws).unwrap();

        sup.manage(AgentId(4), "agents/4/snake.py", ".py").await.unwrap();
        let port = sup.get_server(AgentId(4)).unwrap().port;
        sup.stop(AgentId(4)).await;

        assert!(sup.get_server(AgentId(4)).is_some());
        assert!(sup.ports().is_reserved(port));

        // Nothing listens there, so the probe evicts the paused record.
        assert_eq!(sup.get_status(AgentId(4)).await, WorkerStatus::Offline);
        assert!(sup.get_server(AgentId(4)).is_none());
        assert!(!sup.ports().is_reserved(port));

        // Stopping an unknown agent is not an error.
        sup.stop(AgentId(404)).await;
        sup.stop_and_remove(AgentId(404)).await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn status_of_unmanaged_agent_is_offline() {
        let (sup, dir) = supervisor("sup-status", "exec sleep 30").await;
        assert_eq!(sup.get_status(AgentId(77)).await, WorkerStatus::Offline);
        assert_eq!(sup.ports().reserved_count(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn rerun_starts_a_fresh_process() {
        let (sup, dir) = supervisor("sup-rerun", "exec sleep 30").await;

        sup.manage(AgentId(6), "agents/6/snake.js", ".js").await.unwrap();
        let before = sup.get_server(AgentId(6)).unwrap();
        let after = sup.rerun(AgentId(6), "agents/6/snake.js", ".js").await.unwrap();

        assert_ne!(before.pid, after.pid);
        assert_eq!(after.port, before.port);
        assert_eq!(sup.ports().reserved_count(), 1);
        sup.close().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn ensure_running_reuses_existing_worker() {
        let (sup, dir) = supervisor("sup-ensure", "exec sleep 30").await;

        let a = sup
            .ensure_running(AgentId(2), "agents/2/snake.py", ".py")
            .await
            .unwrap();
        let b = sup
            .ensure_running(AgentId(2), "agents/2/snake.py", ".py")
            .await
            .unwrap();
        assert_eq!(a, b);
        sup.close().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn close_kills_everything_and_is_idempotent() {
        let (sup, dir) = supervisor("sup-close", "exec sleep 30").await;

        sup.manage(AgentId(1), "a/1/snake.py", ".py").await.unwrap();
        sup.manage(AgentId(2), "a/2/snake.js", ".js").await.unwrap();
        let handles: Vec<_> = [AgentId(1), AgentId(2)]
            .into_iter()
            .map(|id| sup.inner.table.handle(id).unwrap())
            .collect();

        sup.close().await;
        assert!(sup.is_closed().await);
        assert!(sup.list().is_empty());
        for h in handles {
            assert!(h.has_exited().await);
        }

        sup.close().await;
        let err = sup.manage(AgentId(3), "a/3/snake.py", ".py").await.unwrap_err();
        assert!(matches!(err, SupervisorError::Closed));
        let err = sup.rerun(AgentId(1), "a/1/snake.py", ".py").await.unwrap_err();
        assert!(matches!(err, SupervisorError::Closed));
        let err = sup
            .ensure_running(AgentId(2), "a/2/snake.js", ".js")
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Closed));

        // Reads and teardown see an empty table rather than failing.
        assert!(sup.get_server(AgentId(1)).is_none());
        assert_eq!(sup.get_status(AgentId(1)).await, WorkerStatus::Offline);
        sup.stop(AgentId(1)).await;
        sup.stop_and_remove(AgentId(2)).await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn stop_and_remove_forgets_idle_launch_lock() {
        let (sup, dir) = supervisor("sup-locks", "exec sleep 30").await;

        sup.manage(AgentId(11), "agents/11/snake.py", ".py").await.unwrap();
        assert!(sup.inner.launch_locks.lock().unwrap().contains_key(&AgentId(11)));

        sup.stop_and_remove(AgentId(11)).await;
        assert!(!sup.inner.launch_locks.lock().unwrap().contains_key(&AgentId(11)));

        // Removing an unknown agent leaves nothing behind either.
        sup.stop_and_remove(AgentId(12)).await;
        assert!(sup.inner.launch_locks.lock().unwrap().is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn mismatched_language_tag_is_rejected_before_launch() {
        let (sup, dir) = supervisor("sup-mismatch", "exec sleep 30").await;

        let err = sup
            .manage(AgentId(13), "agents/13/snake.py", ".js")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "language_mismatch");
        assert!(sup.list().is_empty());
        assert_eq!(sup.ports().reserved_count(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    const PY_SNAKE: &str = r##"
def info():
    return {"color": "#3776ab", "head": "default", "tail": "default"}

def start(state):
    print("start", state["turn"])

def move(state):
    return {"move": "left"}

def end(state):
    print("end")
"##;

    const JS_SNAKE: &str = r##"
function info() { return { color: "#f7df1e", head: "default", tail: "default" }; }
function start(state) { console.log("start", state.turn); }
function move(state) { return { move: "right" }; }
function end(state) { console.log("end"); }
module.exports = { info, start, move, end };
"##;

    // Same shape as the contest's C starter.
    const C_SNAKE: &str = r##"
#include "battlesnake.h"
#include <stdio.h>

SnakeInfo info(void) {
    return (SnakeInfo) { .color = "#555555", .head = "default", .tail = "default" };
}

void gameStart(GameState *state) {
    printf("start %d %s\n", state->turn, state->you.name);
}

void gameEnd(GameState *state) {
    printf("end\n");
}

MoveResult move(GameState *state) {
    MoveResult result = {0};
    Coord head = state->you.body[0];
    Coord neck = state->you.body[1];
    result.move = neck.y > head.y ? "down" : "up";
    if (state->you.length == 3 && state->width == 11) result.taunt = "hiss";
    return result;
}
"##;

    fn game_state() -> serde_json::Value {
        serde_json::json!({
            "game": { "id": "g1" },
            "turn": 4,
            "board": {
                "width": 11,
                "height": 11,
                "food": [{ "x": 1, "y": 1 }],
                "hazards": [],
                "snakes": []
            },
            "you": {
                "id": "s1",
                "name": "pit \"viper\"",
                "health": 90,
                "head": { "x": 5, "y": 5 },
                "body": [{ "x": 5, "y": 5 }, { "x": 5, "y": 4 }, { "x": 5, "y": 3 }],
                "length": 3,
                "customizations": { "color": "#555555", "head": "default", "tail": "default" }
            }
        })
    }

    /// Real interpreters and compiler, production readiness polling.
    async fn real_supervisor(dir: &std::path::Path) -> Supervisor {
        let cfg = SupervisorConfig {
            work_dir: dir.join("servers"),
            log_dir: dir.join("logs"),
            base_port: free_port(),
            max_ports: 1,
            ready_timeout: std::time::Duration::from_secs(10),
            cc: "cc".to_string(),
            build_native_host: true,
            ..SupervisorConfig::default()
        };
        Supervisor::new(cfg).await.unwrap()
    }

    async fn serve_and_move(
        name: &str,
        program: &str,
        file: &str,
        source: &str,
    ) -> Option<(serde_json::Value, serde_json::Value)> {
        if !command_available(program) {
            eprintln!("skipping {name}: `{program}` is not installed");
            return None;
        }
        let dir = temp_dir_for(name);
        let sup = real_supervisor(&dir).await;
        let artifact = dir.join(file);
        std::fs::write(&artifact, source).unwrap();

        let ext = artifact.extension().unwrap().to_str().unwrap().to_string();
        let info = sup.ensure_running(AgentId(1), &artifact, &ext).await.unwrap();
        assert_eq!(sup.get_status(AgentId(1)).await, WorkerStatus::Online);

        let about = call_worker(&format!("{}/", info.base_url), None).await;
        // Start and end replies differ per adapter ("ok" or a status object).
        call_worker(&format!("{}/start", info.base_url), Some(game_state())).await;
        let mv = call_worker(&format!("{}/move", info.base_url), Some(game_state())).await;
        let about: serde_json::Value = serde_json::from_str(&about).unwrap();
        let mv: serde_json::Value = serde_json::from_str(&mv).unwrap();

        sup.close().await;
        let log = std::fs::read_to_string(sup.config().log_path(AgentId(1))).unwrap();
        assert!(log.contains("start 4"), "{log}");
        let _ = std::fs::remove_dir_all(dir);
        Some((about, mv))
    }

    #[tokio::test]
    async fn python_snake_is_served_by_bundled_adapter() {
        let Some((about, mv)) =
            serve_and_move("sup-real-py", "python3", "snake.py", PY_SNAKE).await
        else {
            return;
        };
        assert_eq!(about["color"], "#3776ab");
        assert_eq!(mv["move"], "left");
    }

    #[tokio::test]
    async fn node_snake_is_served_by_bundled_adapter() {
        let Some((about, mv)) = serve_and_move("sup-real-js", "node", "snake.js", JS_SNAKE).await
        else {
            return;
        };
        assert_eq!(about["color"], "#f7df1e");
        assert_eq!(mv["move"], "right");
    }

    #[tokio::test]
    async fn c_snake_compiles_against_header_and_is_preloaded() {
        let Some((about, mv)) = serve_and_move("sup-real-c", "cc", "snake.c", C_SNAKE).await
        else {
            return;
        };
        assert_eq!(about["apiversion"], "1");
        assert_eq!(about["color"], "#555555");
        assert_eq!(mv["move"], "up");
        assert_eq!(mv["taunt"], "hiss");
    }
}
