use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// The category of an [`Event`].
///
/// The serialized names are the ones stored by the event log.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Connection,
    #[serde(rename = "smtp_handshake")]
    Handshake,
    #[serde(rename = "smtp_auth_success")]
    AuthSuccess,
    #[serde(rename = "smtp_auth_failed")]
    AuthFailed,
    #[serde(rename = "smtp_command")]
    Command,
    Error,
    #[serde(rename = "gotify_success")]
    DeliverySuccess,
    #[serde(rename = "gotify_failed")]
    DeliveryFailed,
    Warning,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Connection => "connection",
            Category::Handshake => "smtp_handshake",
            Category::AuthSuccess => "smtp_auth_success",
            Category::AuthFailed => "smtp_auth_failed",
            Category::Command => "smtp_command",
            Category::Error => "error",
            Category::DeliverySuccess => "gotify_success",
            Category::DeliveryFailed => "gotify_failed",
            Category::Warning => "warning",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured record of something that happened in the server.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub category: Category,
    /// A short, single line summary.
    pub message: String,
    /// A longer human readable explanation.
    pub description: String,
}

/// A free-form status line.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Status {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Anything a [`ChannelSink`] can deliver.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Record {
    Event(Event),
    Status(Status),
}

/// The destination of events and status lines.
///
/// Implementations are shared by every connection
/// and must never block the caller;
/// if the destination cannot keep up
/// the record should be dropped.
pub trait Sink: Send + Sync {
    /// Emit a structured event.
    fn event(&self, category: Category, message: String, description: String);

    /// Emit a status line.
    fn status(&self, message: String);
}

/// A [`Sink`] that writes everything to [`tracing`].
#[derive(Clone, Copy, Default, Debug)]
pub struct TracingSink;

impl Sink for TracingSink {
    fn event(&self, category: Category, message: String, description: String) {
        use tracing::{event, Level};
        match category {
            Category::Error
            | Category::AuthFailed
            | Category::DeliveryFailed
            | Category::Warning => {
                event!(Level::WARN, %category, %description, "{message}")
            }
            _ => event!(Level::INFO, %category, %description, "{message}"),
        }
    }

    fn status(&self, message: String) {
        tracing::info!(target: "smtp_to_gotify::status", "{message}");
    }
}

/// A [`Sink`] that forwards into a bounded channel.
///
/// The receiving half is returned as a stream by [`ChannelSink::new`].
/// When the channel is full the record is dropped.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    sender: mpsc::Sender<Record>,
}

impl ChannelSink {
    /// Create a sink holding at most `capacity` undelivered records.
    pub fn new(capacity: usize) -> (Self, ReceiverStream<Record>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, ReceiverStream::new(receiver))
    }

    fn send(&self, record: Record) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                tracing::warn!(?record, "event sink full, dropping record");
            }
            // nobody is listening anymore
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

impl Sink for ChannelSink {
    fn event(&self, category: Category, message: String, description: String) {
        self.send(Record::Event(Event {
            timestamp: Utc::now(),
            category,
            message,
            description,
        }));
    }

    fn status(&self, message: String) {
        self.send(Record::Status(Status {
            timestamp: Utc::now(),
            message,
        }));
    }
}
