use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Change feed: one broadcast channel per canonical branch plus a firehose.
///
/// Subscribers receive events asynchronously and may lag; a lagging receiver
/// should re-read current state rather than trust its last snapshot.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
    all: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one branch. Creates the channel if needed.
    pub fn subscribe(&self, branch: &str) -> broadcast::Receiver<Event> {
        self.channels
            .entry(branch.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    /// Publish to the branch channel and the firehose. No-op without listeners.
    pub fn send(&self, branch: &str, event: &Event) {
        if let Some(sender) = self.channels.get(branch) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaseFields, Event};

    fn updated(key: &str) -> Event {
        Event::CaseUpdated {
            key: key.into(),
            fields: CaseFields::default(),
        }
    }

    #[tokio::test]
    async fn branch_subscriber_sees_only_its_branch() {
        let hub = NotifyHub::new();
        let mut pune = hub.subscribe("Pune");

        hub.send("Sangli", &updated("DVM-SNGL-24-25-001"));
        hub.send("Pune", &updated("DVM-PUNE-24-25-002"));

        assert_eq!(pune.recv().await.unwrap(), updated("DVM-PUNE-24-25-002"));
        assert!(pune.try_recv().is_err());
    }

    #[tokio::test]
    async fn firehose_sees_everything() {
        let hub = NotifyHub::new();
        let mut all = hub.subscribe_all();
        hub.send("Sangli", &updated("DVM-SNGL-24-25-001"));
        hub.send("Pune", &updated("DVM-PUNE-24-25-002"));
        assert_eq!(all.recv().await.unwrap(), updated("DVM-SNGL-24-25-001"));
        assert_eq!(all.recv().await.unwrap(), updated("DVM-PUNE-24-25-002"));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send("Pune", &updated("DVM-PUNE-24-25-001"));
    }
}
