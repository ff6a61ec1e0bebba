use std::fmt;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};
use tokio::time::Instant;

/// Size announced in the `EHLO` reply.
///
/// It also bounds a single line and the collected message.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// An error that ends an SMTP connection.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("connection deadline elapsed")]
    Timeout,
    #[error("connection closed by peer")]
    Closed,
    #[error("line longer than {} bytes", MAX_MESSAGE_SIZE)]
    LineTooLong,
}

/// A failed `AUTH` exchange.
///
/// These never end the connection,
/// the client is told `535` and may try again.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid base64")]
    InvalidBase64,
    #[error("expected 3 NUL separated fields, received {0}")]
    MissingFields(usize),
}

/// A username and password presented by a client.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Plain string comparison against the expected credentials.
    pub fn matches(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

fn decode_base64(data: &str) -> Result<String, AuthError> {
    use base64ct::Encoding;
    let bytes = base64ct::Base64::decode_vec(data.trim())
        .map_err(|_| AuthError::InvalidBase64)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Decode one base64 line of an `AUTH LOGIN` exchange.
pub fn decode_login(line: &str) -> Result<String, AuthError> {
    decode_base64(line)
}

/// Decode an `AUTH PLAIN` response,
/// `base64(authzid NUL username NUL password)`.
///
/// The authorization identity is ignored.
pub fn decode_plain(data: &str) -> Result<Credentials, AuthError> {
    let decoded = decode_base64(data)?;
    let fields: Vec<&str> = decoded.split('\0').collect();
    match fields.as_slice() {
        [_authzid, username, password, ..] => {
            Ok(Credentials::new(*username, *password))
        }
        _ => Err(AuthError::MissingFields(fields.len())),
    }
}

/// A command line sent by the client.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Command {
    /// `HELO` or `EHLO`, with the verb used.
    Hello(String),
    AuthLogin,
    /// `AUTH PLAIN`, possibly with the initial response.
    AuthPlain(Option<String>),
    MailFrom(String),
    RcptTo(String),
    Data,
    Quit,
    Unknown(String),
}

impl Command {
    /// Tokenize a command line.
    ///
    /// Surrounding whitespace, including the line ending, is ignored.
    /// Verbs are matched case-sensitively.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.starts_with("HELO") || line.starts_with("EHLO") {
            Command::Hello(line[..4].to_string())
        } else if line.starts_with("AUTH LOGIN") {
            Command::AuthLogin
        } else if line.starts_with("AUTH PLAIN") {
            Command::AuthPlain(line.split(' ').nth(2).map(str::to_string))
        } else if let Some(address) = line.strip_prefix("MAIL FROM:") {
            Command::MailFrom(strip_brackets(address))
        } else if let Some(address) = line.strip_prefix("RCPT TO:") {
            Command::RcptTo(strip_brackets(address))
        } else if line == "DATA" {
            Command::Data
        } else if line == "QUIT" {
            Command::Quit
        } else {
            Command::Unknown(line.to_string())
        }
    }
}

fn strip_brackets(address: &str) -> String {
    address
        .trim()
        .trim_matches(|c| c == '<' || c == '>')
        .to_string()
}

/// A numeric reply, possibly spanning several lines.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn greeting(domain: &str) -> Self {
        Self::new(220, format!("{domain} SMTP Server Ready"))
    }

    /// The capabilities, including the supported `AUTH` mechanisms.
    pub fn ehlo(domain: &str) -> Self {
        Self::multiline(
            250,
            vec![
                format!("{domain} Hello"),
                "AUTH LOGIN PLAIN".to_string(),
                "8BITMIME".to_string(),
                "ENHANCEDSTATUSCODES".to_string(),
                "CHUNKING".to_string(),
                format!("SIZE {MAX_MESSAGE_SIZE}"),
            ],
        )
    }

    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    /// `Username:` in base64.
    pub fn login_username() -> Self {
        Self::new(334, "VXNlcm5hbWU6")
    }

    /// `Password:` in base64.
    pub fn login_password() -> Self {
        Self::new(334, "UGFzc3dvcmQ6")
    }

    pub fn plain_challenge() -> Self {
        Self::new(334, "")
    }

    pub fn auth_ok() -> Self {
        Self::new(235, "Authentication successful")
    }

    pub fn auth_failed() -> Self {
        Self::new(535, "Authentication failed")
    }

    pub fn auth_required() -> Self {
        Self::new(530, "Authentication required")
    }

    pub fn start_data() -> Self {
        Self::new(354, "Start mail input; end with <CRLF>.<CRLF>")
    }

    pub fn bye() -> Self {
        Self::new(221, "Bye")
    }

    pub fn unknown() -> Self {
        Self::new(500, "Unknown command")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);
        for (index, line) in self.lines.iter().enumerate() {
            let separator = if index == last { ' ' } else { '-' };
            write!(f, "{}{separator}{line}\r\n", self.code)?;
        }
        Ok(())
    }
}

/// Read up to and including a `\n`.
///
/// A connection that ends before a complete line is [`Error::Closed`],
/// a line of more than [`MAX_MESSAGE_SIZE`] bytes is [`Error::LineTooLong`].
pub(crate) async fn read_line(
    mut reader: impl AsyncBufRead + Unpin,
    deadline: Instant,
) -> Result<String, Error> {
    let mut buffer = Vec::with_capacity(256);
    let mut limited = (&mut reader).take(MAX_MESSAGE_SIZE as u64);
    let len = tokio::time::timeout_at(deadline, limited.read_until(b'\n', &mut buffer))
        .await
        .map_err(|_| Error::Timeout)??;
    if !buffer.ends_with(b"\n") {
        if len >= MAX_MESSAGE_SIZE {
            return Err(Error::LineTooLong);
        }
        return Err(Error::Closed);
    }
    let line = String::from_utf8_lossy(&buffer).into_owned();
    tracing::trace!(recv = ?line);
    Ok(line)
}

pub(crate) async fn write(
    mut writer: impl AsyncWrite + Unpin,
    reply: &Reply,
    deadline: Instant,
) -> Result<(), Error> {
    let data = reply.to_string();
    tracing::trace!(send = ?data);
    tokio::time::timeout_at(deadline, async {
        writer.write_all(data.as_bytes()).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| Error::Timeout)??;
    Ok(())
}
