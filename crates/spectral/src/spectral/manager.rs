use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;

use crate::spectral::backend::BackendRequest;

pub type DomainMap = HashMap<String, mpsc::Sender<BackendRequest>>;

/// Read side of the domain map: workers load a snapshot per lookup.
pub type SharedDomains = Arc<ArcSwap<DomainMap>>;

/// Owns the authoritative `domain -> agent inbox` map and publishes it to the
/// workers by atomic snapshot replacement.
///
/// Dropping a removed backend's sender only after publication means requests
/// already dispatched against an old snapshot still drain; the agent task
/// retires once every sender clone is gone.
pub struct WorkerManager {
    shared: SharedDomains,
    domains: DomainMap,
}

impl WorkerManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ArcSwap::from_pointee(DomainMap::new())),
            domains: DomainMap::new(),
        }
    }

    pub fn shared(&self) -> SharedDomains {
        self.shared.clone()
    }

    pub fn add_backend(&mut self, domains: &[String], inbox: mpsc::Sender<BackendRequest>) {
        for domain in domains {
            let key = domain.trim().to_ascii_lowercase();
            if key.is_empty() {
                continue;
            }
            if let Some(previous) = self.domains.insert(key.clone(), inbox.clone()) {
                if !previous.same_channel(&inbox) {
                    tracing::warn!(domain = %key, "manager: domain remapped to another backend");
                }
            }
        }
        self.publish();
    }

    pub fn remove_backend(&mut self, domains: &[String]) {
        for domain in domains {
            self.domains.remove(&domain.trim().to_ascii_lowercase());
        }
        self.publish();
    }

    /// Swap in a whole new registration set (config reload).
    pub fn replace(&mut self, domains: DomainMap) {
        self.domains = domains;
        self.publish();
    }

    pub fn knows_domain(&self, domain: &str) -> bool {
        self.domains.contains_key(&domain.trim().to_ascii_lowercase())
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    fn publish(&self) {
        self.shared.store(Arc::new(self.domains.clone()));
    }
}

impl Default for WorkerManager {
    fn default() -> Self {
        Self::new()
    }
}
