use std::{
    collections::HashMap,
    path::PathBuf,
    process::ExitStatus,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use snakepit_worker::{AgentId, RuntimeKind, WorkerInfo};
use tokio::{process::Child, sync::Mutex};

use crate::port_alloc::PortAllocator;

/// An OS process running in its own process group.
#[derive(Debug)]
pub(crate) struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
    exit: Option<ExitStatus>,
}

impl WorkerProcess {
    pub(crate) fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            exit: None,
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking; caches the exit status once observed.
    pub(crate) fn try_exit_status(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait().ok().flatten();
        }
        self.exit
    }

    /// SIGKILL the whole group, then wait for the leader to be reaped.
    pub(crate) async fn terminate(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.try_exit_status() {
            return Ok(status);
        }

        let mut signalled = false;
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // The child called setsid(), so its pgid equals its pid.
            let rc = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
            signalled = rc == 0;
        }
        if !signalled {
            let _ = self.child.start_kill();
        }

        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(status)
    }
}

/// Narrow, cloneable access to a worker process owned by the table.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    inner: Arc<Mutex<WorkerProcess>>,
    pid: Option<u32>,
}

impl WorkerHandle {
    pub(crate) fn new(process: WorkerProcess) -> Self {
        let pid = process.pid();
        Self {
            inner: Arc::new(Mutex::new(process)),
            pid,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn has_exited(&self) -> bool {
        self.inner.lock().await.try_exit_status().is_some()
    }

    /// Blocks until the process has exited. Safe to call repeatedly.
    pub async fn terminate(&self) -> std::io::Result<ExitStatus> {
        self.inner.lock().await.terminate().await
    }
}

/// One running (or paused) worker. Replaced wholesale, never edited.
#[derive(Debug)]
pub struct WorkerRecord {
    pub(crate) agent_id: AgentId,
    pub(crate) base_url: String,
    pub(crate) artifact_path: PathBuf,
    pub(crate) port: u16,
    pub(crate) runtime: RuntimeKind,
    pub(crate) generation: u64,
    pub(crate) started_at_unix_ms: u64,
    pub(crate) log_path: PathBuf,
    pub(crate) process: WorkerHandle,
    pub(crate) log_file: std::fs::File,
}

impl WorkerRecord {
    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            agent_id: self.agent_id,
            base_url: self.base_url.clone(),
            port: self.port,
            artifact_path: self.artifact_path.display().to_string(),
            runtime: self.runtime,
            pid: self.process.pid(),
            log_path: self.log_path.display().to_string(),
            started_at_unix_ms: self.started_at_unix_ms,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Agent -> worker map. The lock is only ever held for the map operation.
#[derive(Debug)]
pub struct ProcessTable {
    records: RwLock<HashMap<AgentId, WorkerRecord>>,
    ports: Arc<PortAllocator>,
    generation: AtomicU64,
}

impl ProcessTable {
    pub fn new(ports: Arc<PortAllocator>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ports,
            generation: AtomicU64::new(1),
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    pub fn exists(&self, id: AgentId) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn get(&self, id: AgentId) -> Option<WorkerInfo> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(WorkerRecord::info)
    }

    /// Base URL, generation and process of the current record, read together.
    pub(crate) fn target(&self, id: AgentId) -> Option<(String, u64, WorkerHandle)> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|r| (r.base_url.clone(), r.generation, r.process.clone()))
    }

    pub(crate) fn handle(&self, id: AgentId) -> Option<WorkerHandle> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|r| r.process.clone())
    }

    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut out: Vec<WorkerInfo> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(WorkerRecord::info)
            .collect();
        out.sort_by_key(|w| w.agent_id);
        out
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `record`. A displaced record gives its port back (unless the
    /// new one reuses it) and is returned so the caller can stop it.
    pub fn put(&self, record: WorkerRecord) -> Option<WorkerRecord> {
        let new_port = record.port;
        let replaced = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let replaced = records.insert(record.agent_id, record);
            if let Some(old) = &replaced
                && old.port != new_port
            {
                self.ports.release(old.port);
            }
            replaced
        };
        if let Some(old) = &replaced {
            tracing::warn!(
                agent_id = %old.agent_id,
                port = old.port,
                "replaced an existing worker record"
            );
        }
        replaced
    }

    /// Removes the record, releasing its port in the same critical section.
    /// The log file is closed after the lock is dropped.
    pub fn remove(&self, id: AgentId) -> bool {
        self.remove_where(id, |_| true)
    }

    /// Like `remove`, but only if the record is still the probed generation.
    pub fn remove_if_generation(&self, id: AgentId, generation: u64) -> bool {
        self.remove_where(id, |r| r.generation == generation)
    }

    fn remove_where(&self, id: AgentId, pred: impl FnOnce(&WorkerRecord) -> bool) -> bool {
        let removed = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            match records.get(&id) {
                Some(r) if pred(r) => {
                    let r = records.remove(&id);
                    if let Some(r) = &r {
                        self.ports.release(r.port);
                    }
                    r
                }
                _ => None,
            }
        };

        match removed {
            Some(record) => {
                tracing::info!(agent_id = %id, port = record.port, "removed worker record");
                drop(record.log_file);
                true
            }
            None => false,
        }
    }

    /// Empties the table without touching port reservations.
    pub(crate) fn drain(&self) -> Vec<WorkerRecord> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, r)| r)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_fake_worker, spawn_sleeper, temp_dir_for};

    fn table() -> ProcessTable {
        ProcessTable::new(Arc::new(PortAllocator::new(8000, 4)))
    }

    #[tokio::test]
    async fn remove_releases_port_and_forgets_record() {
        let dir = temp_dir_for("table-remove");
        let table = table();

        let handle = insert_fake_worker(&table, AgentId(7), "http://localhost:8000", &dir);
        assert!(table.exists(AgentId(7)));
        assert!(table.ports().is_reserved(8000));
        assert_eq!(table.get(AgentId(7)).unwrap().base_url, "http://localhost:8000");

        handle.terminate().await.unwrap();
        assert!(table.remove(AgentId(7)));
        assert!(!table.exists(AgentId(7)));
        assert!(!table.ports().is_reserved(8000));
        assert!(!table.remove(AgentId(7)));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn stale_generation_does_not_evict_replacement() {
        let dir = temp_dir_for("table-generation");
        let table = table();

        let first = insert_fake_worker(&table, AgentId(1), "http://localhost:8000", &dir);
        let (_, stale, _) = table.target(AgentId(1)).unwrap();
        first.terminate().await.unwrap();
        assert!(table.remove(AgentId(1)));

        let second = insert_fake_worker(&table, AgentId(1), "http://localhost:8000", &dir);
        assert!(!table.remove_if_generation(AgentId(1), stale));
        assert!(table.exists(AgentId(1)));

        let (_, current, _) = table.target(AgentId(1)).unwrap();
        second.terminate().await.unwrap();
        assert!(table.remove_if_generation(AgentId(1), current));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn list_is_sorted_and_drain_keeps_ports() {
        let dir = temp_dir_for("table-drain");
        let table = table();
        let mut handles = Vec::new();
        for id in [3, 1, 2] {
            handles.push(insert_fake_worker(&table, AgentId(id), "http://localhost:1", &dir));
        }

        let ids: Vec<i64> = table.list().iter().map(|w| w.agent_id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let drained = table.drain();
        assert_eq!(drained.len(), 3);
        assert!(table.is_empty());
        assert_eq!(table.ports().reserved_count(), 3);
        for h in handles {
            h.terminate().await.unwrap();
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn terminate_kills_and_reaps() {
        let handle = WorkerHandle::new(WorkerProcess::new(spawn_sleeper()));
        assert!(!handle.has_exited().await);
        let status = handle.terminate().await.unwrap();
        assert!(!status.success());
        assert!(handle.has_exited().await);
        // Idempotent once exited.
        handle.terminate().await.unwrap();
    }
}
