//! This crate provides a small SMTP server
//! that forwards every email it receives as a Gotify notification.
//!
//! The [`Server`] accepts plaintext SMTP with optional
//! `AUTH LOGIN` / `AUTH PLAIN` authentication,
//! extracts the sender, recipients, subject and body of each message
//! and posts them to a Gotify server, retrying failed deliveries.
//! Everything that happens is reported to an injected [`Sink`].
//!
//! # Examples
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use smtp_to_gotify::{Config, Server, Shutdown, TracingSink};
//!
//! let config = Config {
//!     listen_addr: "127.0.0.1:2525".to_string(),
//!     notification_host: "https://gotify.example.com".to_string(),
//!     notification_token: "my-app-token".to_string(),
//!     ..Config::default()
//! };
//! let server = Server::start(config, Arc::new(TracingSink)).await?;
//! println!("listening on {}", server.address()?);
//!
//! let shutdown = async {
//!     let _ = tokio::signal::ctrl_c().await;
//! };
//! if let Shutdown::Forced { active } = server.run(shutdown).await {
//!     println!("gave up on {active} connections");
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod config;
mod email;
mod event;
mod notify;
mod server;
mod session;
mod smtp;

pub use config::{Config, Error as ConfigError};
pub use email::{Envelope, DEFAULT_SUBJECT, MAX_BODY_CHARS, TRUNCATION_MARKER};
pub use event::{Category, ChannelSink, Event, Record, Sink, Status, TracingSink};
pub use notify::{
    Attempt, AttemptError, Attempts, DeliveryError, HttpTransport, Notification,
    Notifier, RetryPolicy, Transport,
};
pub use server::{Connections, Error, Server, Shutdown, GRACE_PERIOD};
pub use session::{Next, Transaction, SESSION_TIMEOUT};
pub use smtp::{AuthError, Command, Credentials, Error as SmtpError, Reply};
