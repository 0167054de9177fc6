use std::{sync::Arc, time::Duration};

use snakepit_worker::{AgentId, WorkerStatus};

use crate::process_table::ProcessTable;

/// One-shot liveness checks against a worker's base URL.
///
/// A worker that fails its probe is torn down and forgotten right away, so the
/// next `manage` starts a fresh process.
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
    table: Arc<ProcessTable>,
}

impl HealthProber {
    pub fn new(table: Arc<ProcessTable>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("snakepit-supervisor/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client, table })
    }

    pub async fn probe(&self, agent_id: AgentId) -> WorkerStatus {
        // Snapshot under the read lock; nothing is held across the request.
        let Some((base_url, generation, handle)) = self.table.target(agent_id) else {
            return WorkerStatus::Offline;
        };

        let failure = match self.client.get(&base_url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => return WorkerStatus::Online,
            Ok(resp) => format!("unexpected status {}", resp.status()),
            Err(err) => crate::config::format_error_chain(&err),
        };

        tracing::warn!(%agent_id, %base_url, %failure, "probe failed; evicting worker");

        // Only tear down the exact worker that was probed.
        if self.table.target(agent_id).map(|(_, g, _)| g) != Some(generation) {
            return WorkerStatus::Offline;
        }
        if let Err(err) = handle.terminate().await {
            tracing::warn!(%agent_id, %err, "failed to terminate evicted worker");
        }
        self.table.remove_if_generation(agent_id, generation);
        WorkerStatus::Offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_alloc::PortAllocator;
    use crate::test_support::{insert_fake_worker, serve_status, temp_dir_for};
    use axum::http::StatusCode;

    fn table() -> Arc<ProcessTable> {
        Arc::new(ProcessTable::new(Arc::new(PortAllocator::new(8000, 8))))
    }

    #[tokio::test]
    async fn unmanaged_agent_is_offline_without_side_effects() {
        let table = table();
        let prober = HealthProber::new(table.clone(), Duration::from_millis(200)).unwrap();
        assert_eq!(prober.probe(AgentId(99)).await, WorkerStatus::Offline);
        assert!(table.is_empty());
        assert_eq!(table.ports().reserved_count(), 0);
    }

    #[tokio::test]
    async fn healthy_worker_is_online_and_kept() {
        let dir = temp_dir_for("prober-ok");
        let table = table();
        let url = serve_status(StatusCode::OK).await;
        let handle = insert_fake_worker(&table, AgentId(1), &url, &dir);

        let prober = HealthProber::new(table.clone(), Duration::from_millis(500)).unwrap();
        assert_eq!(prober.probe(AgentId(1)).await, WorkerStatus::Online);
        assert!(table.exists(AgentId(1)));
        assert!(!handle.has_exited().await);

        handle.terminate().await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unhealthy_worker_is_evicted_and_port_freed() {
        let dir = temp_dir_for("prober-503");
        let table = table();
        let url = serve_status(StatusCode::SERVICE_UNAVAILABLE).await;
        let handle = insert_fake_worker(&table, AgentId(2), &url, &dir);
        let port = table.get(AgentId(2)).unwrap().port;

        let prober = HealthProber::new(table.clone(), Duration::from_millis(500)).unwrap();
        assert_eq!(prober.probe(AgentId(2)).await, WorkerStatus::Offline);
        assert!(!table.exists(AgentId(2)));
        assert!(!table.ports().is_reserved(port));
        assert!(handle.has_exited().await);
        assert_eq!(table.ports().acquire().unwrap(), port);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unreachable_worker_is_evicted() {
        let dir = temp_dir_for("prober-closed");
        let table = table();
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
        drop(listener);
        let handle = insert_fake_worker(&table, AgentId(3), &url, &dir);

        let prober = HealthProber::new(table.clone(), Duration::from_millis(500)).unwrap();
        assert_eq!(prober.probe(AgentId(3)).await, WorkerStatus::Offline);
        assert!(!table.exists(AgentId(3)));
        assert!(handle.has_exited().await);
        let _ = std::fs::remove_dir_all(dir);
    }
}
