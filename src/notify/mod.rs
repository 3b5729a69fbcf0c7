//! Alert delivery.
//!
//! A `Notifier` pushes one `Alert` to its recipients. Threading state lives in
//! a caller-owned `ConversationState` (one per camera), so consecutive alerts
//! from the same camera are grouped under one thread id.

pub mod mqtt;

use anyhow::Result;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;

use crate::telemetry::LogSink;

pub use mqtt::{MqttNotifier, MqttSettings};

const TARGET: &str = "camwatch::notify";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    pub camera_id: String,
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
    /// Annotated image to attach, when one exists.
    pub attachment: Option<PathBuf>,
}

/// Per-camera threading state, owned by the caller and passed to every delivery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversationState {
    thread_id: Option<String>,
    messages_sent: u64,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    /// Thread id for the next message, assigning a random one on first use.
    pub fn thread_id_or_init(&mut self) -> &str {
        self.thread_id.get_or_insert_with(|| {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes);
            hex::encode(bytes)
        })
    }

    /// True when the next message continues an existing thread.
    pub fn is_reply(&self) -> bool {
        self.messages_sent > 0
    }

    /// Call after a successful delivery.
    pub fn record_sent(&mut self) {
        self.messages_sent += 1;
    }
}

pub trait Notifier: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Deliver `alert`. An error means "not delivered"; callers log it and move on.
    fn deliver(&mut self, alert: &Alert, conversation: &mut ConversationState) -> Result<()>;
}

/// Writes alerts to the log. Default when no broker is configured.
pub struct LogNotifier {
    sink: Arc<dyn LogSink>,
}

impl LogNotifier {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn deliver(&mut self, alert: &Alert, conversation: &mut ConversationState) -> Result<()> {
        let reply = conversation.is_reply();
        let thread = conversation.thread_id_or_init().to_string();
        self.sink.info(
            TARGET,
            format_args!(
                "ALERT [{}] thread={}{} to={} subject={:?} body={:?} attachment={}",
                alert.camera_id,
                thread,
                if reply { " (reply)" } else { "" },
                alert.recipients.join(","),
                alert.subject,
                alert.body,
                alert
                    .attachment
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "none".to_string())
            ),
        );
        conversation.record_sent();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use log::Level;

    #[test]
    fn thread_id_is_stable_once_assigned() {
        let mut conversation = ConversationState::new();
        assert!(conversation.thread_id().is_none());
        let first = conversation.thread_id_or_init().to_string();
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(conversation.thread_id_or_init(), first);
    }

    #[test]
    fn threads_differ_between_conversations() {
        let a = ConversationState::new().thread_id_or_init().to_string();
        let b = ConversationState::new().thread_id_or_init().to_string();
        assert_ne!(a, b);
    }

    #[test]
    fn log_notifier_reports_and_counts() -> Result<()> {
        let sink = MemorySink::new();
        let mut notifier = LogNotifier::new(sink.clone());
        let mut conversation = ConversationState::new();
        let alert = Alert {
            camera_id: "cam1".into(),
            subject: "Person detected on Driveway".into(),
            body: "person (0.91)".into(),
            recipients: vec!["ops@example.com".into()],
            attachment: None,
        };
        notifier.deliver(&alert, &mut conversation)?;
        notifier.deliver(&alert, &mut conversation)?;
        assert_eq!(conversation.messages_sent(), 2);
        assert!(sink.contains(Level::Info, "Person detected on Driveway"));
        assert!(sink.contains(Level::Info, "(reply)"));
        Ok(())
    }
}
