use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::{Category, Sink};
use crate::{Config, Envelope};

/// The priority of every notification.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Timeout for a single HTTP request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// The base delay between attempts.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// A message as accepted by the Gotify `/message` endpoint.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub priority: i32,
}

impl Notification {
    pub fn from_envelope(envelope: &Envelope, priority: i32) -> Self {
        Notification {
            title: format!("New Email: {}", envelope.subject),
            message: format!(
                "From: {}\nTo: {}\n\n{}",
                envelope.sender,
                envelope.recipient_list(),
                envelope.body
            ),
            priority,
        }
    }
}

/// A single failed delivery attempt.
#[derive(thiserror::Error, Debug)]
pub enum AttemptError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("endpoint returned status {status}, body: {body}")]
    Status { status: u16, body: String },
}

/// A notification that could not be delivered.
#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error("failed to send notification after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: AttemptError,
    },
    #[error("no delivery attempt was made")]
    NoAttempts,
}

/// Something that can post a [`Notification`] once.
pub trait Transport: Send + Sync + 'static {
    fn post(
        &self,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), AttemptError>> + Send;
}

/// Posts notifications as json to `{host}/message?token={token}`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: config.notification_url(),
        })
    }
}

impl Transport for HttpTransport {
    async fn post(&self, notification: &Notification) -> Result<(), AttemptError> {
        // the url carries the token, keep it out of error messages
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(reqwest::Error::without_url)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(AttemptError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// How often and how patiently to retry.
///
/// The delay after failed attempt `n` is `n * unit`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            unit: DEFAULT_BACKOFF_UNIT,
        }
    }
}

impl RetryPolicy {
    /// The schedule of attempts for one notification.
    pub fn attempts(&self) -> Attempts {
        Attempts {
            policy: *self,
            next: 1,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(attempt)
    }
}

/// One entry of the attempt schedule.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Attempt {
    /// Starts at 1.
    pub number: u32,
    pub total: u32,
    /// How long to wait if this attempt fails,
    /// `None` for the last attempt.
    pub backoff: Option<Duration>,
}

/// Iterator over the [`Attempt`]s of a [`RetryPolicy`].
#[derive(Clone, Debug)]
pub struct Attempts {
    policy: RetryPolicy,
    next: u32,
}

impl Iterator for Attempts {
    type Item = Attempt;

    fn next(&mut self) -> Option<Attempt> {
        let total = self.policy.max_attempts;
        if self.next > total {
            return None;
        }
        let number = self.next;
        self.next += 1;
        Some(Attempt {
            number,
            total,
            backoff: (number < total).then(|| self.policy.delay(number)),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self
            .policy
            .max_attempts
            .saturating_add(1)
            .saturating_sub(self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Attempts {}

/// Turns envelopes into notifications and delivers them.
#[derive(Debug)]
pub struct Notifier<T> {
    transport: T,
    policy: RetryPolicy,
    priority: i32,
    host: String,
}

impl<T: Transport> Notifier<T> {
    /// `host` only names the endpoint in events.
    pub fn new(transport: T, host: impl Into<String>) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            priority: DEFAULT_PRIORITY,
            host: host.into(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Deliver a notification for `envelope`,
    /// returning the number of the successful attempt.
    ///
    /// Every attempt is reported to `sink`.
    pub async fn deliver(
        &self,
        envelope: &Envelope,
        sink: &dyn Sink,
    ) -> Result<u32, DeliveryError> {
        let notification = Notification::from_envelope(envelope, self.priority);
        for attempt in self.policy.attempts() {
            let Attempt { number, total, .. } = attempt;
            match self.transport.post(&notification).await {
                Ok(()) => {
                    sink.event(
                        Category::DeliverySuccess,
                        format!(
                            "Attempt {number}/{total}: notification sent for email from {}",
                            envelope.sender
                        ),
                        format!(
                            "Attempt {number} of {total} delivered the notification to Gotify at {}.",
                            self.host
                        ),
                    );
                    return Ok(number);
                }
                Err(error) => {
                    sink.event(
                        Category::DeliveryFailed,
                        format!(
                            "Attempt {number}/{total}: failed to send notification for email from {}: {error}",
                            envelope.sender
                        ),
                        format!(
                            "Attempt {number} of {total} to deliver the notification to Gotify at {} failed: {error}",
                            self.host
                        ),
                    );
                    match attempt.backoff {
                        Some(delay) => {
                            tracing::debug!(?delay, number, total, "retrying notification");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(DeliveryError::Exhausted {
                                attempts: total,
                                source: error,
                            })
                        }
                    }
                }
            }
        }
        Err(DeliveryError::NoAttempts)
    }
}
