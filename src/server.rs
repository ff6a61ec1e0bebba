use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::event::{Category, Sink};
use crate::notify::{HttpTransport, Notifier, Transport};
use crate::session::{self, Context, SESSION_TIMEOUT};
use crate::Config;

/// How long shutdown waits for open connections.
pub const GRACE_PERIOD: Duration = Duration::from_secs(30);

/// An error while starting the server.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create the http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// How [`Server::run`] ended.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Shutdown {
    /// Every connection finished within the grace period.
    Graceful,
    /// The grace period elapsed with connections still open.
    Forced { active: usize },
}

#[derive(Default, Debug)]
struct Counter {
    live: AtomicUsize,
    idle: Notify,
}

/// A handle on the number of open connections.
#[derive(Clone, Default, Debug)]
pub struct Connections {
    counter: Arc<Counter>,
}

impl Connections {
    pub fn count(&self) -> usize {
        self.counter.live.load(Ordering::SeqCst)
    }

    /// Wait until no connection is open.
    pub async fn idle(&self) {
        loop {
            let notified = self.counter.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn track(&self) -> Guard {
        self.counter.live.fetch_add(1, Ordering::SeqCst);
        Guard {
            counter: self.counter.clone(),
        }
    }
}

/// Counts a connection as open until dropped.
struct Guard {
    counter: Arc<Counter>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.counter.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counter.idle.notify_waiters();
        }
    }
}

/// An SMTP server forwarding every received email as a notification.
pub struct Server<T = HttpTransport> {
    listener: TcpListener,
    config: Config,
    notifier: Notifier<T>,
    sink: Arc<dyn Sink>,
    connections: Connections,
    grace_period: Duration,
    session_timeout: Duration,
}

impl Server {
    /// Start a new server instance,
    /// posting notifications to the configured Gotify server.
    pub async fn start(config: Config, sink: Arc<dyn Sink>) -> Result<Self, Error> {
        let transport = HttpTransport::new(&config)?;
        Self::with_transport(config, transport, sink).await
    }
}

impl<T: Transport> Server<T> {
    /// Start a new server instance delivering through `transport`.
    pub async fn with_transport(
        config: Config,
        transport: T,
        sink: Arc<dyn Sink>,
    ) -> Result<Self, Error> {
        let notifier = Notifier::new(transport, config.notification_host.clone());
        Self::with_notifier(config, notifier, sink).await
    }

    /// Start a new server instance with a fully configured notifier.
    pub async fn with_notifier(
        config: Config,
        notifier: Notifier<T>,
        sink: Arc<dyn Sink>,
    ) -> Result<Self, Error> {
        let address = config.bind_address();
        let listener = match TcpListener::bind(&address).await {
            Ok(listener) => listener,
            Err(source) => return Err(Error::Bind { address, source }),
        };
        let bound = listener
            .local_addr()
            .map(|bound| bound.to_string())
            .unwrap_or(address);
        tracing::info!(address = %bound, "listening");
        sink.status(format!("SMTP server listening on {bound}"));
        sink.event(
            Category::Connection,
            format!("SMTP server started on {bound}"),
            format!(
                "Listening on {bound} for domain {}, forwarding to Gotify at {}, authentication required: {}.",
                config.domain, config.notification_host, config.auth_required
            ),
        );
        Ok(Self {
            listener,
            config,
            notifier,
            sink,
            connections: Connections::default(),
            grace_period: GRACE_PERIOD,
            session_timeout: SESSION_TIMEOUT,
        })
    }

    /// Return the address and port to which this server bound.
    pub fn address(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub fn connections(&self) -> Connections {
        self.connections.clone()
    }

    /// How long [`Server::run`] waits for open connections after `shutdown`.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// How long a connection may stay open in total.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Accept connections until `shutdown` completes,
    /// then wait for open connections up to the grace period.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Shutdown {
        let Server {
            listener,
            config,
            notifier,
            sink,
            connections,
            grace_period,
            session_timeout,
        } = self;
        let context = Arc::new(Context {
            config,
            notifier,
            sink: sink.clone(),
            timeout: session_timeout,
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let guard = connections.track();
                        let context = context.clone();
                        tokio::spawn(async move {
                            session::serve(stream, peer, &context).await;
                            drop(guard);
                        });
                    }
                    Err(error) => {
                        tracing::warn!(%error, "accept failed");
                        sink.status(format!("Error accepting connection: {error}"));
                        sink.event(
                            Category::Error,
                            format!("Error accepting connection: {error}"),
                            format!("The listener failed to accept a connection and keeps accepting: {error}"),
                        );
                    }
                },
                () = &mut shutdown => break,
            }
        }

        sink.status("Shutting down SMTP server...".to_string());
        sink.event(
            Category::Connection,
            "Shutdown signal received".to_string(),
            "The server stopped accepting connections and waits for open connections to finish."
                .to_string(),
        );
        drop(listener);
        sink.event(
            Category::Connection,
            "SMTP listener closed".to_string(),
            "The listening socket was closed, new connections are refused.".to_string(),
        );

        let open = connections.count();
        tracing::info!(open, ?grace_period, "waiting for connections");
        match tokio::time::timeout(grace_period, connections.idle()).await {
            Ok(()) => {
                sink.status("Server gracefully stopped".to_string());
                sink.event(
                    Category::Connection,
                    "Server gracefully stopped".to_string(),
                    format!("All {open} open connections finished within {grace_period:?}."),
                );
                Shutdown::Graceful
            }
            Err(_) => {
                let active = connections.count();
                sink.status(format!("Server forced to shutdown with {active} open connections"));
                sink.event(
                    Category::Warning,
                    format!("Server forced to shutdown with {active} open connections"),
                    format!(
                        "{active} connections were still open after the grace period of {grace_period:?}."
                    ),
                );
                Shutdown::Forced { active }
            }
        }
    }
}
