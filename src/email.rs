/// Subject used when the message has no `Subject:` line.
pub const DEFAULT_SUBJECT: &str = "No Subject";

/// Bodies longer than this many characters are truncated.
pub const MAX_BODY_CHARS: usize = 5000;

/// Appended to a truncated body.
pub const TRUNCATION_MARKER: &str = "... (truncated)";

/// The parts of a received email that are forwarded.
#[derive(Clone, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub struct Envelope {
    /// The sender as given by `MAIL FROM`.
    pub sender: String,

    /// The recipients as given by `RCPT TO`,
    /// in the order they were received.
    pub recipients: Vec<String>,

    /// The subject, taken from the first `Subject:` line.
    pub subject: String,

    /// Everything after the header block,
    /// cut to [`MAX_BODY_CHARS`].
    pub body: String,
}

impl Envelope {
    /// Extract an envelope from the raw `DATA` payload.
    ///
    /// This never fails:
    /// there is no MIME decoding,
    /// only a split between the headers and the body.
    pub fn parse(sender: String, recipients: Vec<String>, data: &str) -> Self {
        Envelope {
            sender,
            recipients,
            subject: find_subject(data),
            body: truncate(find_body(data)),
        }
    }

    /// The recipients joined with `", "`.
    pub fn recipient_list(&self) -> String {
        self.recipients.join(", ")
    }
}

fn find_subject(data: &str) -> String {
    data.split('\n')
        .find(|line| line.starts_with("Subject:"))
        .map(decode_subject)
        .unwrap_or_else(|| DEFAULT_SUBJECT.to_string())
}

/// Strip the header name and decode any encoded words.
fn decode_subject(line: &str) -> String {
    let line = line.trim_end();
    let raw = line["Subject:".len()..].trim();
    if !raw.contains("=?") {
        return raw.to_string();
    }
    if raw.is_ascii() {
        return decode_words(raw).unwrap_or_else(|| raw.to_string());
    }
    // mailparse reads raw bytes as latin-1, so only hand it the encoded words
    raw.split(' ')
        .map(|word| {
            if word.starts_with("=?") && word.ends_with("?=") {
                decode_words(word).unwrap_or_else(|| word.to_string())
            } else {
                word.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_words(value: &str) -> Option<String> {
    let header = format!("Subject: {value}");
    let (header, _) = mailparse::parse_header(header.as_bytes()).ok()?;
    Some(header.get_value().trim().to_string())
}

fn find_body(data: &str) -> &str {
    match data.find("\r\n\r\n") {
        Some(index) => &data[index + 4..],
        None => data,
    }
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_BODY_CHARS) {
        Some((end, _)) => format!("{}{TRUNCATION_MARKER}", &body[..end]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{Envelope, DEFAULT_SUBJECT, MAX_BODY_CHARS, TRUNCATION_MARKER};

    fn parse(data: &str) -> Envelope {
        Envelope::parse(
            "sender@example.com".to_string(),
            vec!["recipient@example.com".to_string()],
            data,
        )
    }

    #[test]
    fn subject_and_body() {
        let envelope = parse("Subject: Hi\r\n\r\nHello world\r\n");
        assert_eq!(envelope.subject, "Hi");
        assert_eq!(envelope.body, "Hello world\r\n");
        assert_eq!(envelope.sender, "sender@example.com");
        assert_eq!(envelope.recipients, vec!["recipient@example.com"]);
    }

    #[test]
    fn subject_among_other_headers() {
        let envelope = parse(
            "From: Friend <friend@example.com>\r\n\
             To: self@example.com\r\n\
             Subject:   Weekly report  \r\n\
             Subject: second\r\n\
             \r\n\
             Numbers are up.\r\n",
        );
        assert_eq!(envelope.subject, "Weekly report");
        assert_eq!(envelope.body, "Numbers are up.\r\n");
    }

    #[test]
    fn subject_is_case_sensitive() {
        let envelope = parse("subject: lower\r\n\r\nbody\r\n");
        assert_eq!(envelope.subject, DEFAULT_SUBJECT);
    }

    #[test]
    fn missing_subject() {
        let envelope = parse("From: a@b.com\r\n\r\nbody\r\n");
        assert_eq!(envelope.subject, "No Subject");
        assert_eq!(envelope.body, "body\r\n");
    }

    #[test]
    fn encoded_subject() {
        let envelope = parse("Subject: =?UTF-8?B?SGVsbG8gd29ybGQ=?=\r\n\r\n");
        assert_eq!(envelope.subject, "Hello world");
    }

    #[test]
    fn encoded_word_next_to_utf8() {
        let envelope = parse("Subject: Grüße =?UTF-8?B?SGk=?=\r\n\r\n");
        assert_eq!(envelope.subject, "Grüße Hi");
        let envelope = parse("Subject: Grüße =?bogus\r\n\r\n");
        assert_eq!(envelope.subject, "Grüße =?bogus");
    }

    #[test]
    fn utf8_subject_is_verbatim() {
        let envelope = parse("Subject: Grüße aus Köln\r\n\r\n");
        assert_eq!(envelope.subject, "Grüße aus Köln");
    }

    #[test]
    fn no_header_separator() {
        let data = "just some text\r\nwithout headers\r\n";
        let envelope = parse(data);
        assert_eq!(envelope.body, data);
    }

    #[test]
    fn body_at_limit_is_kept() {
        let body = "x".repeat(MAX_BODY_CHARS);
        let envelope = parse(&format!("Subject: s\r\n\r\n{body}"));
        assert_eq!(envelope.body, body);
    }

    #[test]
    fn long_body_is_truncated() {
        let body = "y".repeat(MAX_BODY_CHARS + 100);
        let envelope = parse(&format!("Subject: s\r\n\r\n{body}"));
        assert_eq!(
            envelope.body,
            format!("{}{TRUNCATION_MARKER}", "y".repeat(MAX_BODY_CHARS))
        );
        assert_eq!(
            envelope.body.chars().count(),
            MAX_BODY_CHARS + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn truncation_counts_characters() {
        let body = "é".repeat(MAX_BODY_CHARS + 1);
        let envelope = parse(&format!("\r\n\r\n{body}"));
        assert!(envelope.body.starts_with(&"é".repeat(MAX_BODY_CHARS)));
        assert!(envelope.body.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            envelope.body.chars().count(),
            MAX_BODY_CHARS + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn recipient_list() {
        let envelope = Envelope::parse(
            "a@b.com".to_string(),
            vec![
                "c@d.com".to_string(),
                "e@f.com".to_string(),
                "c@d.com".to_string(),
            ],
            "",
        );
        assert_eq!(envelope.recipient_list(), "c@d.com, e@f.com, c@d.com");
        assert_eq!(envelope.subject, DEFAULT_SUBJECT);
        assert_eq!(envelope.body, "");
    }
}
