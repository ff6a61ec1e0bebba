use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::time::Instant;

use crate::event::{Category, Sink};
use crate::notify::{Notifier, Transport};
use crate::smtp::{
    self, decode_login, decode_plain, AuthError, Command, Credentials, Error, Reply,
    MAX_MESSAGE_SIZE,
};
use crate::{Config, Envelope};

/// Every connection is closed this long after it was accepted.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// What the connection has to do after a command.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Next {
    Reply(Reply),
    /// Run the `AUTH LOGIN` challenges.
    Login,
    /// Finish `AUTH PLAIN`, asking for the response if it was not inline.
    Plain(Option<String>),
    /// Collect the message.
    Data,
    Quit,
}

/// The protocol state of one connection.
#[derive(Clone, Default, Debug)]
pub struct Transaction {
    authenticated: bool,
    principal: Option<String>,
    sender: String,
    recipients: Vec<String>,
    data: String,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The user that authenticated, if any.
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Apply a command.
    ///
    /// Commands that need more input from the client
    /// return the follow-up instead of a reply.
    pub fn apply(&mut self, command: &Command, config: &Config) -> Next {
        match command {
            Command::Hello(_) => Next::Reply(Reply::ehlo(&config.domain)),
            Command::AuthLogin => Next::Login,
            Command::AuthPlain(initial) => Next::Plain(initial.clone()),
            Command::MailFrom(address) => {
                if self.rejects(config) {
                    return Next::Reply(Reply::auth_required());
                }
                self.sender = address.clone();
                Next::Reply(Reply::ok())
            }
            Command::RcptTo(address) => {
                if self.rejects(config) {
                    return Next::Reply(Reply::auth_required());
                }
                self.recipients.push(address.clone());
                Next::Reply(Reply::ok())
            }
            Command::Data => {
                if self.rejects(config) {
                    return Next::Reply(Reply::auth_required());
                }
                Next::Data
            }
            Command::Quit => Next::Quit,
            Command::Unknown(_) => Next::Reply(Reply::unknown()),
        }
    }

    fn rejects(&self, config: &Config) -> bool {
        config.auth_required && !self.authenticated
    }

    /// Check presented credentials against the configured ones.
    ///
    /// A failure leaves the state untouched.
    pub fn authenticate(&mut self, credentials: &Credentials, config: &Config) -> Reply {
        if credentials.matches(&config.username, &config.password) {
            self.authenticated = true;
            self.principal = Some(credentials.username.clone());
            Reply::auth_ok()
        } else {
            Reply::auth_failed()
        }
    }

    /// Append a message line, including its line ending.
    ///
    /// Lines that would grow the message past [`MAX_MESSAGE_SIZE`]
    /// are discarded and `false` is returned.
    pub fn push_data(&mut self, line: &str) -> bool {
        if self.data.len() + line.len() > MAX_MESSAGE_SIZE {
            return false;
        }
        self.data.push_str(line);
        true
    }

    /// Complete the message and reset for the next one.
    ///
    /// Authentication is kept.
    pub fn finish(&mut self) -> Envelope {
        let sender = std::mem::take(&mut self.sender);
        let recipients = std::mem::take(&mut self.recipients);
        let data = std::mem::take(&mut self.data);
        Envelope::parse(sender, recipients, &data)
    }
}

/// Everything a connection needs, shared by all connections.
pub(crate) struct Context<T> {
    pub config: Config,
    pub notifier: Notifier<T>,
    pub sink: Arc<dyn Sink>,
    pub timeout: Duration,
}

/// Serve one client until it quits, fails or runs out of time.
pub(crate) async fn serve<S, T>(stream: S, peer: SocketAddr, context: &Context<T>)
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Transport,
{
    let sink = &*context.sink;
    sink.status(format!("New SMTP connection from {peer}"));
    sink.event(
        Category::Connection,
        format!("New SMTP connection from {peer}"),
        format!("Client connected from {peer}, starting the SMTP handshake."),
    );

    let mut session = Session {
        stream: BufStream::new(stream),
        peer,
        deadline: Instant::now() + context.timeout,
        transaction: Transaction::new(),
        context,
    };
    match session.run().await {
        Ok(()) => {
            sink.status(format!("Client disconnected from {peer}"));
            sink.event(
                Category::Connection,
                format!("Client disconnected from {peer}"),
                format!("Client at {peer} sent QUIT and the connection was closed."),
            );
        }
        Err(error) => {
            tracing::debug!(%peer, %error, "connection ended");
            sink.status(format!("Error reading from connection: {error}"));
            sink.event(
                Category::Error,
                format!("Error reading from connection from {peer}: {error}"),
                format!("The connection from {peer} ended without QUIT: {error}"),
            );
        }
    }
}

struct Session<'a, S, T> {
    stream: BufStream<S>,
    peer: SocketAddr,
    deadline: Instant,
    transaction: Transaction,
    context: &'a Context<T>,
}

impl<'a, S, T> Session<'a, S, T>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Transport,
{
    fn sink(&self) -> &'a dyn Sink {
        &*self.context.sink
    }

    async fn read(&mut self) -> Result<String, Error> {
        smtp::read_line(&mut self.stream, self.deadline).await
    }

    async fn reply(&mut self, reply: &Reply) -> Result<(), Error> {
        smtp::write(&mut self.stream, reply, self.deadline).await
    }

    async fn run(&mut self) -> Result<(), Error> {
        self.reply(&Reply::greeting(&self.context.config.domain))
            .await?;
        loop {
            let line = self.read().await?;
            let command = Command::parse(&line);
            match self.transaction.apply(&command, &self.context.config) {
                Next::Reply(reply) => {
                    self.report(&command, &reply);
                    self.reply(&reply).await?;
                }
                Next::Login => self.auth_login().await?,
                Next::Plain(initial) => self.auth_plain(initial).await?,
                Next::Data => self.data().await?,
                Next::Quit => {
                    self.reply(&Reply::bye()).await?;
                    return Ok(());
                }
            }
        }
    }

    fn report(&self, command: &Command, reply: &Reply) {
        let sink = self.sink();
        let peer = self.peer;
        if *reply == Reply::auth_required() {
            let verb = match command {
                Command::MailFrom(_) => "MAIL",
                Command::RcptTo(_) => "RCPT",
                _ => "DATA",
            };
            sink.status(format!(
                "Rejecting {verb} command: Authentication required"
            ));
            sink.event(
                Category::Error,
                format!("Rejecting {verb} command from {peer}: Authentication required"),
                format!(
                    "Client at {peer} sent {verb} without authenticating while authentication is required."
                ),
            );
            return;
        }
        match command {
            Command::Hello(verb) => sink.event(
                Category::Handshake,
                format!("Received {verb} from {peer}"),
                format!(
                    "Client at {peer} greeted with {verb}, the supported extensions including AUTH were announced."
                ),
            ),
            Command::MailFrom(address) => sink.event(
                Category::Command,
                format!("MAIL FROM {address} accepted from {peer}"),
                format!("Client at {peer} set the sender to {address}."),
            ),
            Command::RcptTo(address) => sink.event(
                Category::Command,
                format!("RCPT TO {address} accepted from {peer}"),
                format!("Client at {peer} added the recipient {address}."),
            ),
            Command::Unknown(line) => sink.event(
                Category::Error,
                format!("Unknown command received from {peer}: {line}"),
                format!("Client at {peer} sent the unsupported command '{line}'."),
            ),
            _ => {}
        }
    }

    async fn auth_login(&mut self) -> Result<(), Error> {
        self.reply(&Reply::login_username()).await?;
        let username = match decode_login(&self.read().await?) {
            Ok(username) => username,
            Err(error) => return self.auth_malformed("LOGIN", "username", error).await,
        };
        self.reply(&Reply::login_password()).await?;
        let password = match decode_login(&self.read().await?) {
            Ok(password) => password,
            Err(error) => return self.auth_malformed("LOGIN", "password", error).await,
        };
        self.authenticate("LOGIN", Credentials { username, password })
            .await
    }

    async fn auth_plain(&mut self, initial: Option<String>) -> Result<(), Error> {
        let response = match initial {
            Some(response) => response,
            None => {
                self.reply(&Reply::plain_challenge()).await?;
                self.read().await?
            }
        };
        match decode_plain(&response) {
            Ok(credentials) => self.authenticate("PLAIN", credentials).await,
            Err(error) => self.auth_malformed("PLAIN", "response", error).await,
        }
    }

    async fn authenticate(
        &mut self,
        mechanism: &str,
        credentials: Credentials,
    ) -> Result<(), Error> {
        let reply = self
            .transaction
            .authenticate(&credentials, &self.context.config);
        let sink = self.sink();
        let peer = self.peer;
        let user = &credentials.username;
        if reply == Reply::auth_ok() {
            sink.status(format!("Authentication successful ({mechanism})"));
            sink.event(
                Category::AuthSuccess,
                format!("User {user} authenticated successfully ({mechanism}) from {peer}"),
                format!("Client at {peer} presented valid credentials for {user} using AUTH {mechanism}."),
            );
        } else {
            sink.status(format!(
                "Authentication failed: Invalid credentials ({mechanism})"
            ));
            sink.event(
                Category::AuthFailed,
                format!("Failed authentication for user {user} ({mechanism}) from {peer}"),
                format!("Client at {peer} presented invalid credentials for {user} using AUTH {mechanism}."),
            );
        }
        self.reply(&reply).await
    }

    async fn auth_malformed(
        &mut self,
        mechanism: &str,
        field: &str,
        error: AuthError,
    ) -> Result<(), Error> {
        let sink = self.sink();
        let peer = self.peer;
        sink.status(format!("Error decoding {mechanism} {field}: {error}"));
        sink.event(
            Category::Error,
            format!("Error decoding {mechanism} {field} from {peer}: {error}"),
            format!("Client at {peer} sent a malformed {field} during AUTH {mechanism}: {error}"),
        );
        self.reply(&Reply::auth_failed()).await
    }

    async fn data(&mut self) -> Result<(), Error> {
        let sink = self.sink();
        let peer = self.peer;
        sink.event(
            Category::Command,
            format!("DATA command received from {peer}"),
            format!("Client at {peer} started sending the message content."),
        );
        self.reply(&Reply::start_data()).await?;

        // only an exact ".\r\n" ends the message, lines are not unstuffed
        let mut discarded = 0usize;
        loop {
            let line = self.read().await?;
            if line == ".\r\n" {
                break;
            }
            if !self.transaction.push_data(&line) {
                discarded += line.len();
            }
        }
        if discarded > 0 {
            sink.event(
                Category::Warning,
                format!("Message from {peer} exceeds {MAX_MESSAGE_SIZE} bytes"),
                format!("Discarded {discarded} bytes of the message from {peer} beyond the size limit."),
            );
        }

        sink.event(
            Category::Command,
            format!("DATA completed from {peer}"),
            format!("Client at {peer} finished sending the message content, the message was accepted."),
        );
        self.reply(&Reply::ok()).await?;

        let envelope = self.transaction.finish();
        let recipients = envelope.recipient_list();
        match self.context.notifier.deliver(&envelope, sink).await {
            Ok(_) => {
                sink.status(format!(
                    "Successfully sent notification to Gotify for email from {}",
                    envelope.sender
                ));
                sink.event(
                    Category::DeliverySuccess,
                    format!(
                        "Successfully sent notification to Gotify for email from {}",
                        envelope.sender
                    ),
                    format!(
                        "Forwarded the notification for email from {} to {recipients} with subject '{}'.",
                        envelope.sender, envelope.subject
                    ),
                );
            }
            Err(error) => {
                sink.status(format!("Failed to send to Gotify: {error}"));
                sink.event(
                    Category::DeliveryFailed,
                    format!(
                        "Failed to send to Gotify for email from {}: {error}",
                        envelope.sender
                    ),
                    format!(
                        "Could not forward the notification for email from {} to {recipients} with subject '{}': {error}",
                        envelope.sender, envelope.subject
                    ),
                );
            }
        }
        Ok(())
    }
}
