//! Progress and result events pushed to whoever started the task.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::scraper::Platform;

pub const KEY_MESSAGE: &str = "message";
pub const KEY_IMAGES: &str = "images";
pub const KEY_API_DATA: &str = "api_data";
pub const KEY_PROFILE_IMAGE: &str = "profile_image";
pub const KEY_ERROR: &str = "error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePayload {
    pub key: String,
    pub data: Value,
}

/// An event emitted on behalf of one scraper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub service: Platform,
    pub data: ServicePayload,
}

/// An event about the task as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    GlobalMessage {
        data: String,
    },
    TwitterReport {
        data: Value,
    },
    System {
        status: String,
        #[serde(rename = "resultId")]
        result_id: String,
    },
}

impl TaskEvent {
    pub fn completed(result_id: impl Into<String>) -> Self {
        TaskEvent::System {
            status: "COMPLETED".into(),
            result_id: result_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Service(ServiceEvent),
    Task(TaskEvent),
}

impl ProgressEvent {
    pub fn service(service: Platform, key: impl Into<String>, data: Value) -> Self {
        ProgressEvent::Service(ServiceEvent {
            service,
            data: ServicePayload {
                key: key.into(),
                data,
            },
        })
    }

    /// `(service, key)` for scraper events, `None` for task events.
    pub fn service_key(&self) -> Option<(Platform, &str)> {
        match self {
            ProgressEvent::Service(event) => Some((event.service, event.data.key.as_str())),
            ProgressEvent::Task(_) => None,
        }
    }
}

impl From<TaskEvent> for ProgressEvent {
    fn from(event: TaskEvent) -> Self {
        ProgressEvent::Task(event)
    }
}

/// Destination for progress events. Owned by the caller of the task.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            debug!("progress receiver dropped; event discarded");
        }
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Scraper-scoped helper that tags every event with the platform.
#[derive(Clone)]
pub struct ScraperProgress {
    service: Platform,
    sink: Arc<dyn ProgressSink>,
}

impl ScraperProgress {
    pub fn new(service: Platform, sink: Arc<dyn ProgressSink>) -> Self {
        Self { service, sink }
    }

    pub fn service(&self) -> Platform {
        self.service
    }

    pub fn send(&self, key: &str, data: Value) {
        self.sink
            .emit(ProgressEvent::service(self.service, key, data));
    }

    pub fn message(&self, message: impl Into<String>) {
        self.send(KEY_MESSAGE, Value::String(message.into()));
    }

    pub fn images<P: AsRef<std::path::Path>>(&self, paths: &[P]) {
        let paths = paths
            .iter()
            .map(|path| Value::String(path.as_ref().display().to_string()))
            .collect();
        self.send(KEY_IMAGES, Value::Array(paths));
    }

    pub fn error(&self, kind: &str, message: impl Into<String>) {
        self.send(
            KEY_ERROR,
            serde_json::json!({ "kind": kind, "message": message.into() }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shapes_match_the_frontend_protocol() {
        let event = ProgressEvent::service(Platform::Twitter, KEY_MESSAGE, json!("Capturing tweets"));
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"service": "twitter", "data": {"key": "message", "data": "Capturing tweets"}})
        );

        let done = ProgressEvent::Task(TaskEvent::completed("ab12"));
        assert_eq!(
            serde_json::to_value(&done).unwrap(),
            json!({"type": "system", "status": "COMPLETED", "resultId": "ab12"})
        );

        let global = ProgressEvent::Task(TaskEvent::GlobalMessage { data: String::new() });
        assert_eq!(
            serde_json::to_value(&global).unwrap(),
            json!({"type": "global_message", "data": ""})
        );
    }

    #[test]
    fn events_parse_back_into_the_right_variant() {
        let parsed: ProgressEvent =
            serde_json::from_value(json!({"type": "twitter_report", "data": {"x": 1}})).unwrap();
        assert!(matches!(parsed, ProgressEvent::Task(TaskEvent::TwitterReport { .. })));
    }

    #[tokio::test]
    async fn scraper_progress_tags_events() {
        let (sink, mut rx) = ChannelSink::new();
        let progress = ScraperProgress::new(Platform::Telegram, Arc::new(sink));
        progress.images(&["/tmp/a.png"]);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.service_key(), Some((Platform::Telegram, KEY_IMAGES)));
    }
}
