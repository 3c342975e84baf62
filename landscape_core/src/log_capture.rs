//! Forwards `landscape::*` tracing events to a channel.
//!
//! The external writer drains the receiver next to the step frames so run
//! logs end up beside the output they describe.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const TARGET_PREFIX: &str = "landscape::";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: String,
    pub target: String,
    /// Event name such as `step.retry`.
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    pub fn field_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(serde_json::Value::as_f64)
    }

    pub fn field_u64(&self, name: &str) -> Option<u64> {
        self.fields.get(name).and_then(serde_json::Value::as_u64)
    }
}

#[derive(Clone)]
pub struct LogForwardLayer {
    sender: Sender<LogRecord>,
}

impl LogForwardLayer {
    pub fn new(sender: Sender<LogRecord>) -> Self {
        Self { sender }
    }

    /// Layer plus the receiving end of its channel.
    pub fn channel() -> (Self, Receiver<LogRecord>) {
        let (sender, receiver) = unbounded();
        (Self::new(sender), receiver)
    }
}

impl<S> Layer<S> for LogForwardLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !metadata.target().starts_with(TARGET_PREFIX) {
            return;
        }
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        let record = LogRecord {
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor
                .message
                .unwrap_or_else(|| metadata.target().to_string()),
            fields: visitor.fields,
        };
        // A dropped receiver only means nobody is listening any more.
        let _ = self.sender.send(record);
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl RecordVisitor {
    fn record_value(&mut self, field: &Field, value: serde_json::Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for RecordVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        match serde_json::Number::from_f64(value) {
            Some(number) => self.record_value(field, serde_json::Value::Number(number)),
            None => self.record_value(field, serde_json::Value::String(value.to_string())),
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record_value(field, serde_json::Value::String(format!("{value:?}")));
    }
}
