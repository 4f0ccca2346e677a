//! Many-to-many fan-out of structured messages to subscribed clients, with
//! heartbeat-driven dead-subscriber pruning. One `tokio::sync::broadcast`
//! channel per project, created lazily on first subscribe or publish.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::persistence::{Feature, HelpRequest, LogEntry, Session};
use crate::state::ProjectStatus;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Log(LogEntry),
    Status(ProjectStatus),
    Progress { total: usize, passed: usize, percentage: f64 },
    FeaturesSync(Vec<Feature>),
    FeatureUpdate { feature_id: String, passes: bool },
    SessionUpdate(Session),
    AgentCount { active: usize, total: usize },
    HumanHelp(HelpRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub project_id: String,
    #[serde(flatten)]
    pub message: Message,
}

#[derive(Debug, Default)]
pub struct BroadcastHub {
    channels: Mutex<BTreeMap<String, broadcast::Sender<Envelope>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, project_id: &str) -> broadcast::Sender<Envelope> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, project_id: &str) -> broadcast::Receiver<Envelope> {
        self.sender_for(project_id).subscribe()
    }

    /// Best-effort: a send failure (no subscribers) is not an error, per the
    /// orchestrator's "broadcast never blocks the stream" policy.
    pub fn publish(&self, project_id: &str, message: Message) {
        let sender = self.sender_for(project_id);
        let _ = sender.send(Envelope { project_id: project_id.to_string(), message });
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.channels
            .lock()
            .unwrap()
            .get(project_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

/// Per-subscriber heartbeat tracker. The WebSocket handler drives this: every
/// 30 s it calls `tick()`; if the previous ping's pong never arrived, the
/// subscriber is terminated and its slot reclaimed.
#[derive(Debug, Default)]
pub struct Heartbeat {
    awaiting_pong: bool,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_pong(&mut self) {
        self.awaiting_pong = false;
    }

    /// Returns `true` if this subscriber should be terminated (missed the
    /// previous ping's pong); otherwise arms a new ping wait.
    pub fn tick(&mut self) -> bool {
        if self.awaiting_pong {
            return true;
        }
        self.awaiting_pong = true;
        false
    }
}

/// True iff the subscribe handshake may proceed: no token configured, or the
/// provided token matches exactly.
pub fn token_matches(configured: Option<&str>, provided: Option<&str>) -> bool {
    match configured {
        None => true,
        Some(expected) => provided == Some(expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{LogKind};

    fn sample_log() -> LogEntry {
        LogEntry {
            id: "l1".into(),
            session_id: "s1".into(),
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            kind: LogKind::Assistant,
            content: "hi".into(),
            tool_name: None,
            tool_input: None,
            agent_index: Some(0),
            temporary: None,
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_error() {
        let hub = BroadcastHub::new();
        hub.publish("p1", Message::Status(ProjectStatus::Running));
    }

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let hub = BroadcastHub::new();
        let mut rx = hub.subscribe("p1");
        hub.publish("p1", Message::Log(sample_log()));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.project_id, "p1");
        assert_eq!(received.message, Message::Log(sample_log()));
    }

    #[tokio::test]
    async fn subscribers_are_isolated_per_project() {
        let hub = BroadcastHub::new();
        let mut rx_a = hub.subscribe("a");
        let mut rx_b = hub.subscribe("b");
        hub.publish("a", Message::Status(ProjectStatus::Running));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn subscriber_count_tracks_active_receivers() {
        let hub = BroadcastHub::new();
        assert_eq!(hub.subscriber_count("p1"), 0);
        let rx = hub.subscribe("p1");
        assert_eq!(hub.subscriber_count("p1"), 1);
        drop(rx);
        assert_eq!(hub.subscriber_count("p1"), 0);
    }

    #[test]
    fn heartbeat_terminates_after_missed_pong() {
        let mut hb = Heartbeat::new();
        assert!(!hb.tick()); // first ping armed
        assert!(hb.tick()); // no pong arrived -> terminate
    }

    #[test]
    fn heartbeat_survives_when_pong_received() {
        let mut hb = Heartbeat::new();
        assert!(!hb.tick());
        hb.on_pong();
        assert!(!hb.tick());
    }

    #[test]
    fn token_matches_open_when_unconfigured() {
        assert!(token_matches(None, None));
        assert!(token_matches(None, Some("anything")));
    }

    #[test]
    fn token_matches_requires_exact_match() {
        assert!(token_matches(Some("secret"), Some("secret")));
        assert!(!token_matches(Some("secret"), Some("wrong")));
        assert!(!token_matches(Some("secret"), None));
    }
}
