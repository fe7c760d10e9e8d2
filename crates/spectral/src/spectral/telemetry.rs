use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use tokio::sync::watch;

/// Installs a Prometheus recorder for the `metrics` crate and returns the
/// handle used to render the exposition format.
///
/// Called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub client: String,
    pub host: String,
    pub backend: String,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, s: SessionInfo) {
        self.sessions.insert(s.id.clone(), s);
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out = Vec::with_capacity(self.sessions.len());
        for s in self.sessions.iter() {
            out.push(s.value().clone());
        }
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub type SharedSessions = Arc<SessionRegistry>;

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

/// Counts live spliced connections so shutdown can wait for them to drain.
#[derive(Debug)]
pub struct WorkGroup {
    count: watch::Sender<i64>,
}

impl WorkGroup {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    pub fn open(self: &Arc<Self>) -> WorkGuard {
        self.count.send_modify(|n| *n += 1);
        WorkGuard {
            group: Arc::clone(self),
        }
    }

    pub fn active(&self) -> i64 {
        *self.count.borrow()
    }

    /// Resolves once no connection is live.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // wait_for checks the current value before suspending.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for WorkGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct WorkGuard {
    group: Arc<WorkGroup>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.group.count.send_modify(|n| *n -= 1);
    }
}

/// Monotonic counter; an increment signals an admin-triggered reload.
#[derive(Debug, Clone)]
pub struct ReloadSignal {
    pub seq: u64,
}

impl ReloadSignal {
    pub fn new() -> Self {
        Self { seq: 0 }
    }

    pub fn next(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }
}

impl Default for ReloadSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_registry_snapshot_is_ordered() {
        let reg = SessionRegistry::new();
        for (i, at) in [30u64, 10, 20].iter().enumerate() {
            reg.add(SessionInfo {
                id: format!("s{i}"),
                client: "127.0.0.1:1".into(),
                host: "example.local".into(),
                backend: "127.0.0.1:25600".into(),
                started_at_unix_ms: *at,
            });
        }
        let snap = reg.snapshot();
        let starts: Vec<u64> = snap.iter().map(|s| s.started_at_unix_ms).collect();
        assert_eq!(starts, vec![10, 20, 30]);

        reg.remove("s0");
        assert_eq!(reg.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn work_group_waits_for_guards() {
        let group = Arc::new(WorkGroup::new());
        let guard = group.open();
        assert_eq!(group.active(), 1);

        let waiter = {
            let group = group.clone();
            tokio::spawn(async move { group.wait_idle().await })
        };
        drop(guard);
        waiter.await.expect("wait");
        assert_eq!(group.active(), 0);
    }

    #[tokio::test]
    async fn work_group_idle_resolves_immediately() {
        let group = Arc::new(WorkGroup::new());
        group.wait_idle().await;
    }
}
