use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::Identity;

/// A registered worker and its heartbeat deadline.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerEntry {
    pub identity: Identity,
    pub service: String,
    pub registered_at: DateTime<Utc>,
    #[serde(skip)]
    pub deadline: Instant,
}

impl WorkerEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.deadline
    }
}

/// Snapshot of a worker as reported by `SERVER-WORKERS`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub identity: Identity,
    pub service: String,
    pub busy: bool,
    pub registered_at: DateTime<Utc>,
}

/// Workers known to the broker, grouped by service in registration order.
///
/// Busyness is tracked apart from registration so that a worker keeps its
/// entry, and its deadline, across the jobs it runs.
#[derive(Debug)]
pub struct WorkerRegistry {
    services: HashMap<String, Vec<WorkerEntry>>,
    busy: HashSet<Identity>,
    seen_services: BTreeSet<String>,
    expiry: Duration,
}

impl WorkerRegistry {
    /// `expiry` is the heartbeat interval times the tolerated misses.
    pub fn new(expiry: Duration) -> Self {
        Self {
            services: HashMap::new(),
            busy: HashSet::new(),
            seen_services: BTreeSet::new(),
            expiry,
        }
    }

    /// Handle a READY: drop any registration of `identity` under another
    /// service, then append (or refresh) it under `service` as idle.
    pub fn register(&mut self, identity: Identity, service: &str, now: Instant) {
        let stale: Vec<String> = self
            .services
            .iter()
            .filter(|(svc, list)| {
                svc.as_str() != service && list.iter().any(|w| w.identity == identity)
            })
            .map(|(svc, _)| svc.clone())
            .collect();
        for svc in stale {
            tracing::info!(
                worker = %identity,
                old_service = %svc,
                service,
                "Worker moved to another service"
            );
            self.delete(&identity, &svc);
        }
        self.busy.remove(&identity);
        self.append(identity, service, now);
    }

    /// Insert a worker at the end of its service list with a fresh
    /// deadline. Appending a known worker only refreshes its deadline.
    /// Returns false for a duplicate.
    pub fn append(&mut self, identity: Identity, service: &str, now: Instant) -> bool {
        self.seen_services.insert(service.to_string());
        let deadline = now + self.expiry;
        let list = self.services.entry(service.to_string()).or_default();
        if let Some(entry) = list.iter_mut().find(|w| w.identity == identity) {
            tracing::debug!(worker = %identity, service, "Duplicate worker registration");
            entry.deadline = deadline;
            return false;
        }
        tracing::info!(worker = %identity, service, "Appending worker");
        list.push(WorkerEntry {
            identity,
            service: service.to_string(),
            registered_at: Utc::now(),
            deadline,
        });
        true
    }

    /// Remove a worker from one service, if present.
    pub fn delete(&mut self, identity: &Identity, service: &str) -> bool {
        let Some(list) = self.services.get_mut(service) else {
            return false;
        };
        let before = list.len();
        list.retain(|w| &w.identity != identity);
        let removed = list.len() != before;
        if removed {
            self.busy.remove(identity);
        }
        removed
    }

    /// Push a worker's deadline out after any contact. Returns false if the
    /// worker is unknown.
    pub fn refresh(&mut self, identity: &Identity, now: Instant) -> bool {
        let deadline = now + self.expiry;
        for list in self.services.values_mut() {
            if let Some(entry) = list.iter_mut().find(|w| &w.identity == identity) {
                entry.deadline = deadline;
                return true;
            }
        }
        false
    }

    pub fn get(&self, identity: &Identity) -> Option<&WorkerEntry> {
        self.services
            .values()
            .flat_map(|list| list.iter())
            .find(|w| &w.identity == identity)
    }

    pub fn is_known(&self, identity: &Identity) -> bool {
        self.get(identity).is_some()
    }

    /// Whether any worker has ever registered for `service`.
    pub fn has_seen(&self, service: &str) -> bool {
        self.seen_services.contains(service)
    }

    pub fn seen_services(&self) -> impl Iterator<Item = &str> {
        self.seen_services.iter().map(String::as_str)
    }

    /// First idle worker for `service` in registration order.
    pub fn select(&self, service: &str) -> Option<Identity> {
        self.services
            .get(service)?
            .iter()
            .find(|w| !self.busy.contains(&w.identity))
            .map(|w| w.identity.clone())
    }

    pub fn mark_busy(&mut self, identity: &Identity) {
        self.busy.insert(identity.clone());
    }

    pub fn release(&mut self, identity: &Identity) -> bool {
        self.busy.remove(identity)
    }

    pub fn is_busy(&self, identity: &Identity) -> bool {
        self.busy.contains(identity)
    }

    /// Workers not currently running a job.
    pub fn idle(&self) -> impl Iterator<Item = &WorkerEntry> {
        self.services
            .values()
            .flat_map(|list| list.iter())
            .filter(|w| !self.busy.contains(&w.identity))
    }

    /// Remove every worker whose deadline has passed and return them.
    pub fn purge_stale(&mut self, now: Instant) -> Vec<WorkerEntry> {
        let mut purged = Vec::new();
        for list in self.services.values_mut() {
            let (dead, alive): (Vec<_>, Vec<_>) =
                list.drain(..).partition(|w| w.is_expired(now));
            *list = alive;
            purged.extend(dead);
        }
        for worker in &purged {
            self.busy.remove(&worker.identity);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of registrations under one service.
    pub fn service_len(&self, service: &str) -> usize {
        self.services.get(service).map_or(0, Vec::len)
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        let mut services: Vec<&String> = self.services.keys().collect();
        services.sort();
        services
            .into_iter()
            .flat_map(|svc| self.services[svc].iter())
            .map(|w| WorkerInfo {
                identity: w.identity.clone(),
                service: w.service.clone(),
                busy: self.busy.contains(&w.identity),
                registered_at: w.registered_at,
            })
            .collect()
    }
}
