//! Broadcast bus (C8, §4.8): a set of connected `/ws` clients, each with an
//! optional repo-id subscription, published to by `broadcast(message)`.
//!
//! Grounded on `src/serve_session.rs`'s `message_queue: Arc<MessageQueue<...>>`
//! field and its subscribe-by-value usage (the `message_queue` module itself
//! was not retrieved, so the pub/sub shape here is reconstructed from its
//! call sites plus design note "Broadcast bus ... broadcast iterates a
//! snapshot copy so slow/dead clients don't hold the lock").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

/// A message is dropped after this many consecutive failed sends, per
/// design note "A sink that fails to send twice is evicted."
const MAX_SEND_FAILURES: u32 = 2;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "scan.updated")]
    ScanUpdated { repo_id: String, snapshot: serde_json::Value },
    #[serde(rename = "plan.updated")]
    PlanUpdated { repo_id: String, planning_session_id: uuid::Uuid, plan: serde_json::Value },
    #[serde(rename = "branches.changed")]
    BranchesChanged { repo_id: String },
    #[serde(rename = "external-link.created")]
    ExternalLinkCreated { planning_session_id: uuid::Uuid, link: serde_json::Value },
    #[serde(rename = "external-link.updated")]
    ExternalLinkUpdated { planning_session_id: uuid::Uuid, link: serde_json::Value },
    #[serde(rename = "external-link.deleted")]
    ExternalLinkDeleted { planning_session_id: uuid::Uuid, link_id: uuid::Uuid },
}

impl Event {
    pub fn scan_updated(repo_id: &str, snapshot: &impl Serialize) -> Self {
        Event::ScanUpdated {
            repo_id: repo_id.to_string(),
            snapshot: serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn branches_changed(repo_id: &str) -> Self {
        Event::BranchesChanged { repo_id: repo_id.to_string() }
    }

    /// The repo id a message is scoped to, if any — messages with no scope
    /// (`None`) go to every connected client regardless of subscription.
    fn repo_id(&self) -> Option<&str> {
        match self {
            Event::ScanUpdated { repo_id, .. } => Some(repo_id),
            Event::PlanUpdated { repo_id, .. } => Some(repo_id),
            Event::BranchesChanged { repo_id } => Some(repo_id),
            Event::ExternalLinkCreated { .. }
            | Event::ExternalLinkUpdated { .. }
            | Event::ExternalLinkDeleted { .. } => None,
        }
    }
}

struct Client {
    id: u64,
    repo_id: Option<String>,
    sender: mpsc::UnboundedSender<String>,
    failures: u32,
}

/// The process-wide set of connected `/ws` clients.
#[derive(Default)]
pub struct Broadcaster {
    clients: Mutex<Vec<Client>>,
    next_id: AtomicU64,
}

/// A handle returned to the request surface on `/ws` connect; dropping it
/// (or calling [`Subscription::unsubscribe`]) removes the client.
pub struct Subscription {
    id: u64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Broadcaster {
            clients: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new client with no subscription yet; the first message
    /// it sends over the socket is expected to be `{type:"subscribe",
    /// repoId}`, applied via [`Broadcaster::set_subscription`].
    pub fn connect(&self) -> (Subscription, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().unwrap().push(Client {
            id,
            repo_id: None,
            sender: tx,
            failures: 0,
        });
        (Subscription { id }, rx)
    }

    pub fn set_subscription(&self, subscription: &Subscription, repo_id: Option<String>) {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.iter_mut().find(|c| c.id == subscription.id) {
            client.repo_id = repo_id;
        }
    }

    pub fn disconnect(&self, subscription: &Subscription) {
        self.clients.lock().unwrap().retain(|c| c.id != subscription.id);
    }

    /// Sends `event` to every client whose subscription is absent or
    /// matches the event's repo id. Iterates a snapshot copy of the client
    /// list so a slow or dead client never holds the lock during send.
    pub fn broadcast(&self, event: Event) {
        let payload = match serde_json::to_string(&event) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize broadcast event");
                return;
            }
        };
        let scope = event.repo_id();

        let snapshot: Vec<(u64, mpsc::UnboundedSender<String>)> = {
            let clients = self.clients.lock().unwrap();
            clients
                .iter()
                .filter(|c| scope.is_none() || c.repo_id.is_none() || c.repo_id.as_deref() == scope)
                .map(|c| (c.id, c.sender.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, sender) in snapshot {
            if sender.send(payload.clone()).is_err() {
                dead.push(id);
            }
        }
        self.record_failures_and_evict(&dead);
    }

    fn record_failures_and_evict(&self, failed_ids: &[u64]) {
        if failed_ids.is_empty() {
            return;
        }
        let mut clients = self.clients.lock().unwrap();
        for client in clients.iter_mut() {
            if failed_ids.contains(&client.id) {
                client.failures += 1;
            }
        }
        clients.retain(|c| c.failures < MAX_SEND_FAILURES);
    }

    pub fn connected_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unscoped_events_reach_every_client_regardless_of_subscription() {
        let bus = Broadcaster::new();
        let (sub_a, mut rx_a) = bus.connect();
        bus.set_subscription(&sub_a, Some("acme/widgets".to_string()));
        let (_sub_b, mut rx_b) = bus.connect();

        bus.broadcast(Event::ExternalLinkDeleted {
            planning_session_id: uuid::Uuid::new_v4(),
            link_id: uuid::Uuid::new_v4(),
        });

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn scoped_events_only_reach_matching_subscribers() {
        let bus = Broadcaster::new();
        let (sub_a, mut rx_a) = bus.connect();
        bus.set_subscription(&sub_a, Some("acme/widgets".to_string()));
        let (sub_b, mut rx_b) = bus.connect();
        bus.set_subscription(&sub_b, Some("other/repo".to_string()));

        bus.broadcast(Event::branches_changed("acme/widgets"));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn client_is_evicted_after_two_failed_sends() {
        let bus = Broadcaster::new();
        let (_sub, rx) = bus.connect();
        drop(rx); // receiver dropped -> every send on this channel now fails

        assert_eq!(bus.connected_count(), 1);
        bus.broadcast(Event::branches_changed("acme/widgets"));
        assert_eq!(bus.connected_count(), 1);
        bus.broadcast(Event::branches_changed("acme/widgets"));
        assert_eq!(bus.connected_count(), 0);
    }
}
