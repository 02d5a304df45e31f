//! Per-project progress events shared by generation and the environment manager.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::Stream;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::broadcast;

use crate::manager::state::EnvironmentState;

/// Events kept per project for late subscribers.
pub const HISTORY_LIMIT: usize = 64;

const CHANNEL_CAPACITY: usize = 256;

// ── Phase ───────────────────────────────────────────────────────────

/// What an event is about. Serialized as a flat string:
/// `generating:<strategy>:<step>` or the environment state name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Generating { strategy: String, step: String },
    Environment(EnvironmentState),
}

impl Phase {
    pub fn generating(strategy: &str, step: &str) -> Self {
        Phase::Generating {
            strategy: strategy.to_string(),
            step: step.to_string(),
        }
    }

    pub fn environment_state(&self) -> Option<EnvironmentState> {
        match self {
            Phase::Environment(state) => Some(*state),
            Phase::Generating { .. } => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        if let Some(rest) = value.strip_prefix("generating:") {
            let (strategy, step) = rest.split_once(':')?;
            return Some(Phase::generating(strategy, step));
        }
        EnvironmentState::parse(value).map(Phase::Environment)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Generating { strategy, step } => write!(f, "generating:{strategy}:{step}"),
            Phase::Environment(state) => f.write_str(state.as_str()),
        }
    }
}

impl From<EnvironmentState> for Phase {
    fn from(state: EnvironmentState) -> Self {
        Phase::Environment(state)
    }
}

impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Phase::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("unknown phase: {raw}")))
    }
}

// ── Event ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub project_id: String,
    pub phase: Phase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusEvent {
    pub fn new(project_id: &str, phase: impl Into<Phase>, message: impl Into<String>) -> Self {
        Self {
            project_id: project_id.to_string(),
            phase: phase.into(),
            message: message.into(),
            preview_url: None,
            error: None,
        }
    }

    pub fn with_preview_url(mut self, url: impl Into<String>) -> Self {
        self.preview_url = Some(url.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

// ── Channel ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorded {
    history: HashMap<String, VecDeque<StatusEvent>>,
    preview_urls: HashMap<String, String>,
}

/// Cloneable fan-out of status events.
///
/// Publishing records the event in a bounded per-project history and
/// broadcasts it to live subscribers. Recording and sending happen under one
/// lock so history order equals delivery order.
#[derive(Clone)]
pub struct StatusChannel {
    tx: broadcast::Sender<StatusEvent>,
    recorded: Arc<Mutex<Recorded>>,
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            recorded: Arc::new(Mutex::new(Recorded::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn publish(&self, event: StatusEvent) {
        tracing::debug!(
            project_id = %event.project_id,
            phase = %event.phase,
            message = %event.message,
            "status"
        );
        let mut recorded = self.lock();
        if let Some(url) = &event.preview_url {
            recorded
                .preview_urls
                .insert(event.project_id.clone(), url.clone());
        }
        let history = recorded
            .history
            .entry(event.project_id.clone())
            .or_default();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(event.clone());
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    /// Recorded events for `project_id`, oldest first.
    pub fn history(&self, project_id: &str) -> Vec<StatusEvent> {
        self.lock()
            .history
            .get(project_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The last preview URL any event carried for `project_id`.
    pub fn latest_preview_url(&self, project_id: &str) -> Option<String> {
        self.lock().preview_urls.get(project_id).cloned()
    }

    /// Live events for `project_id` published after this call.
    pub fn subscribe(&self, project_id: &str) -> impl Stream<Item = StatusEvent> + Send + use<> {
        filtered(self.tx.subscribe(), project_id.to_string())
    }

    /// History snapshot plus a live stream that continues exactly after it.
    pub fn subscribe_with_history(
        &self,
        project_id: &str,
    ) -> (Vec<StatusEvent>, impl Stream<Item = StatusEvent> + Send + use<>) {
        let recorded = self.lock();
        let rx = self.tx.subscribe();
        let history = recorded
            .history
            .get(project_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();
        drop(recorded);
        (history, filtered(rx, project_id.to_string()))
    }
}

fn filtered(
    mut rx: broadcast::Receiver<StatusEvent>,
    project_id: String,
) -> impl Stream<Item = StatusEvent> + Send + use<> {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) if event.project_id == project_id => yield event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(project_id = %project_id, skipped = n, "status subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn phase_serializes_flat() {
        let generating = Phase::generating("enhanced", "requesting");
        assert_eq!(serde_json::to_value(&generating).unwrap(), "generating:enhanced:requesting");
        let ready = Phase::from(EnvironmentState::Ready);
        assert_eq!(serde_json::to_value(&ready).unwrap(), "ready");

        let back: Phase = serde_json::from_str("\"generating:template:render\"").unwrap();
        assert_eq!(back, Phase::generating("template", "render"));
        assert!(serde_json::from_str::<Phase>("\"warming_up\"").is_err());
    }

    #[test]
    fn event_schema_omits_absent_fields() {
        let event = StatusEvent::new("p1", EnvironmentState::Creating, "allocating");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"project_id": "p1", "phase": "creating", "message": "allocating"})
        );

        let ready = StatusEvent::new("p1", EnvironmentState::Ready, "live")
            .with_preview_url("http://x");
        let json = serde_json::to_value(&ready).unwrap();
        assert_eq!(json["preview_url"], "http://x");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn history_is_bounded_per_project() {
        let channel = StatusChannel::new();
        for i in 0..(HISTORY_LIMIT + 10) {
            channel.publish(StatusEvent::new("p1", EnvironmentState::Creating, format!("e{i}")));
        }
        channel.publish(StatusEvent::new("p2", EnvironmentState::Creating, "other"));

        let history = channel.history("p1");
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].message, "e10");
        assert_eq!(channel.history("p2").len(), 1);
        assert!(channel.history("p3").is_empty());
    }

    #[test]
    fn latest_preview_url_survives_later_events() {
        let channel = StatusChannel::new();
        channel.publish(StatusEvent::new("p1", EnvironmentState::Ready, "live").with_preview_url("http://a"));
        channel.publish(StatusEvent::new("p1", EnvironmentState::Destroyed, "gone"));
        assert_eq!(channel.latest_preview_url("p1").as_deref(), Some("http://a"));
        assert_eq!(channel.latest_preview_url("p2"), None);
    }

    #[tokio::test]
    async fn subscriber_sees_only_its_project_in_order() {
        let channel = StatusChannel::new();
        let mut stream = Box::pin(channel.subscribe("p1"));

        channel.publish(StatusEvent::new("p2", EnvironmentState::Creating, "noise"));
        channel.publish(StatusEvent::new("p1", EnvironmentState::Creating, "one"));
        channel.publish(StatusEvent::new("p1", EnvironmentState::Mounting, "two"));

        assert_eq!(stream.next().await.unwrap().message, "one");
        assert_eq!(stream.next().await.unwrap().message, "two");
    }

    #[tokio::test]
    async fn history_then_live_has_no_gap() {
        let channel = StatusChannel::new();
        channel.publish(StatusEvent::new("p1", EnvironmentState::Creating, "before"));

        let (history, stream) = channel.subscribe_with_history("p1");
        let mut stream = Box::pin(stream);
        channel.publish(StatusEvent::new("p1", EnvironmentState::Mounting, "after"));

        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "before");
        assert_eq!(stream.next().await.unwrap().message, "after");
    }

    #[tokio::test]
    async fn streams_outlive_the_borrowed_channel_and_id() {
        let channel = StatusChannel::new();
        let (history, live) = {
            let project_id = String::from("p1");
            let borrowed = channel.clone();
            borrowed.subscribe_with_history(&project_id)
        };
        let reader = tokio::spawn(async move {
            let mut live = Box::pin(live);
            live.next().await.map(|e| e.message)
        });

        channel.publish(StatusEvent::new("p1", EnvironmentState::Creating, "spawned"));
        assert!(history.is_empty());
        assert_eq!(reader.await.unwrap().as_deref(), Some("spawned"));
    }
}
