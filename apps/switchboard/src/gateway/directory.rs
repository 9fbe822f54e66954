//! Session directory: application session → live endpoints.
//!
//! One explicitly owned instance lives in `AppState`. All mutations go through
//! the `DashMap` entry API so they are atomic with respect to lookups, and
//! lookups return snapshots rather than views into the map.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::auth::SessionInfo;

use super::endpoint::{Endpoint, EndpointStatus};

#[derive(Default)]
pub struct SessionDirectory {
    sessions: DashMap<String, HashMap<String, Arc<Endpoint>>>,
}

/// Directory size for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryCounts {
    pub sessions: usize,
    pub endpoints: usize,
    pub degraded: usize,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `endpoint`, replacing any endpoint already registered for the
    /// same (session, resource). Returns the replaced one.
    pub fn register(&self, endpoint: Arc<Endpoint>) -> Option<Arc<Endpoint>> {
        self.sessions
            .entry(endpoint.session_id.clone())
            .or_default()
            .insert(endpoint.resource.clone(), endpoint)
    }

    /// Remove `endpoint` if it is still the one registered under its
    /// (session, resource). The session itself is owned externally; an empty
    /// entry only means the session is not routable right now.
    pub fn unregister(&self, endpoint: &Endpoint) -> bool {
        let mut removed = false;
        if let Some(mut resources) = self.sessions.get_mut(&endpoint.session_id) {
            if resources
                .get(&endpoint.resource)
                .is_some_and(|current| std::ptr::eq(current.as_ref(), endpoint))
            {
                resources.remove(&endpoint.resource);
                removed = true;
            }
        }
        if removed {
            self.sessions
                .remove_if(&endpoint.session_id, |_, resources| resources.is_empty());
        }
        removed
    }

    /// Every endpoint of `session_id`, as a point-in-time snapshot.
    pub fn lookup(&self, session_id: &str) -> Vec<Arc<Endpoint>> {
        self.sessions
            .get(session_id)
            .map(|resources| resources.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn lookup_exact(&self, session_id: &str, resource: &str) -> Option<Arc<Endpoint>> {
        self.sessions
            .get(session_id)
            .and_then(|resources| resources.get(resource).cloned())
    }

    /// Find the live endpoint for (session, resource) or register a new one,
    /// atomically. Returns the endpoint and whether it already existed
    /// (a resume). Closed endpoints are never resumed.
    pub fn get_or_register(
        &self,
        session: &SessionInfo,
        resource: &str,
        queue_capacity: usize,
    ) -> (Arc<Endpoint>, bool) {
        let mut resources = self.sessions.entry(session.session_id.clone()).or_default();
        if let Some(existing) = resources.get(resource) {
            if existing.status() != EndpointStatus::Closed {
                return (existing.clone(), true);
            }
        }
        let endpoint = Arc::new(Endpoint::new(session, resource, queue_capacity));
        resources.insert(resource.to_string(), endpoint.clone());
        (endpoint, false)
    }

    /// Snapshot of every registered endpoint.
    pub fn all(&self) -> Vec<Arc<Endpoint>> {
        self.sessions
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn counts(&self) -> DirectoryCounts {
        let mut counts = DirectoryCounts::default();
        for entry in self.sessions.iter() {
            counts.sessions += 1;
            for endpoint in entry.value().values() {
                counts.endpoints += 1;
                if endpoint.status() == EndpointStatus::Degraded {
                    counts.degraded += 1;
                }
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> SessionInfo {
        SessionInfo {
            session_id: id.into(),
            user_id: format!("usr_{id}"),
            context_id: "ctx_1".into(),
        }
    }

    #[test]
    fn register_and_lookup_by_session_and_resource() {
        let dir = SessionDirectory::new();
        let s = session("ses_1");
        dir.register(Arc::new(Endpoint::new(&s, "Browser", 8)));
        dir.register(Arc::new(Endpoint::new(&s, "Phone", 8)));
        dir.register(Arc::new(Endpoint::new(&session("ses_2"), "Browser", 8)));

        assert_eq!(dir.lookup("ses_1").len(), 2);
        assert_eq!(dir.lookup("ses_2").len(), 1);
        assert!(dir.lookup("ses_3").is_empty());
        assert_eq!(
            dir.lookup_exact("ses_1", "Phone").map(|e| e.resource.clone()),
            Some("Phone".to_string())
        );
        assert!(dir.lookup_exact("ses_1", "Tablet").is_none());
        assert_eq!(dir.counts().endpoints, 3);
        assert_eq!(dir.counts().sessions, 2);
    }

    #[test]
    fn unregister_last_endpoint_drops_routability_only() {
        let dir = SessionDirectory::new();
        let ep = Arc::new(Endpoint::new(&session("ses_1"), "Browser", 8));
        dir.register(ep.clone());
        assert!(dir.unregister(&ep));
        assert!(!dir.unregister(&ep));
        assert!(dir.lookup("ses_1").is_empty());
        assert_eq!(dir.counts(), DirectoryCounts::default());
    }

    #[test]
    fn unregister_ignores_replaced_endpoint() {
        let dir = SessionDirectory::new();
        let s = session("ses_1");
        let old = Arc::new(Endpoint::new(&s, "Browser", 8));
        let new = Arc::new(Endpoint::new(&s, "Browser", 8));
        dir.register(old.clone());
        dir.register(new.clone());
        assert!(!dir.unregister(&old));
        assert_eq!(dir.lookup_exact("ses_1", "Browser").unwrap().id, new.id);
    }

    #[test]
    fn get_or_register_resumes_live_endpoint() {
        let dir = SessionDirectory::new();
        let s = session("ses_1");
        let (first, resumed) = dir.get_or_register(&s, "Browser", 8);
        assert!(!resumed);
        let (again, resumed) = dir.get_or_register(&s, "Browser", 8);
        assert!(resumed);
        assert_eq!(first.id, again.id);

        first.mark_closed();
        let (fresh, resumed) = dir.get_or_register(&s, "Browser", 8);
        assert!(!resumed);
        assert_ne!(fresh.id, first.id);
    }

    #[test]
    fn lookup_is_a_snapshot() {
        let dir = SessionDirectory::new();
        let s = session("ses_1");
        dir.register(Arc::new(Endpoint::new(&s, "Browser", 8)));
        let snapshot = dir.lookup("ses_1");
        dir.register(Arc::new(Endpoint::new(&s, "Phone", 8)));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(dir.all().len(), 2);
    }

    #[test]
    fn concurrent_registration_keeps_every_endpoint() {
        let dir = Arc::new(SessionDirectory::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let dir = dir.clone();
                std::thread::spawn(move || {
                    let s = session("ses_1");
                    for j in 0..50 {
                        dir.get_or_register(&s, &format!("r{i}-{j}"), 4);
                        let _ = dir.lookup("ses_1");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(dir.lookup("ses_1").len(), 400);
    }
}
