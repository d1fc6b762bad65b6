use mail_parser::MessageParser;
use std::borrow::Cow;

/// Snapshot of the full raw message (headers and body) taken once per
/// transaction for the forward check. Never mutated; header rewrites go to
/// the live transaction instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDocument {
    raw: Vec<u8>,
}

impl MessageDocument {
    /// Build the EML text from headers in arrival order plus the body.
    pub fn from_parts<'a, I>(headers: I, body: &[u8]) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut raw = Vec::with_capacity(body.len() + 1024);
        for (name, value) in headers {
            raw.extend_from_slice(name.as_bytes());
            raw.extend_from_slice(b": ");
            raw.extend_from_slice(value.as_bytes());
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(body);
        Self { raw }
    }

    /// EML text as sent to the forward endpoint.
    pub fn eml(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn message_id(&self) -> Option<String> {
        MessageParser::default()
            .parse(&self.raw)
            .and_then(|m| m.message_id().map(str::to_string))
    }
}
