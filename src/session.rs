use std::fmt;

use crate::error::FilterError;

/// Envelope recipient accepted at RCPT time.
///
/// Forwarding overwrites it in place so anything that later routes on the
/// envelope recipient sees the forwarding address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientIdentity {
    pub local_part: String,
    pub domain: String,
}

impl RecipientIdentity {
    pub fn new(local_part: &str, domain: &str) -> Result<Self, FilterError> {
        if local_part.is_empty() || domain.is_empty() {
            return Err(FilterError::InvalidInput(format!(
                "recipient has empty local part or domain: {:?}@{:?}",
                local_part, domain
            )));
        }

        Ok(Self {
            local_part: local_part.to_string(),
            domain: domain.to_string(),
        })
    }

    /// Parse a RCPT argument such as `<user@example.com>` or `user@example.com`.
    pub fn parse(arg: &str) -> Result<Self, FilterError> {
        let trimmed = arg.trim();
        let bare = trimmed
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(trimmed);

        match bare.rsplit_once('@') {
            Some((local_part, domain)) => Self::new(local_part, domain),
            None => Err(FilterError::InvalidInput(format!(
                "recipient has no domain: {:?}",
                arg
            ))),
        }
    }

    /// Canonical `local@domain` lookup key.
    pub fn address(&self) -> String {
        format!("{}@{}", self.local_part, self.domain)
    }
}

impl fmt::Display for RecipientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

/// Per-connection state carried from the RCPT phase to end of message.
#[derive(Debug, Default)]
pub struct SessionState {
    recipient: Option<RecipientIdentity>,
    parse_body: bool,
}

impl SessionState {
    /// Record an accepted recipient. A later accepted RCPT on the same
    /// transaction replaces the earlier one.
    pub fn accept_recipient(&mut self, recipient: RecipientIdentity) {
        self.recipient = Some(recipient);
        self.parse_body = true;
    }

    pub fn recipient(&self) -> Option<&RecipientIdentity> {
        self.recipient.as_ref()
    }

    pub fn recipient_mut(&mut self) -> Option<&mut RecipientIdentity> {
        self.recipient.as_mut()
    }

    /// Whether the message body must be retained for the forward check.
    pub fn parse_body(&self) -> bool {
        self.parse_body
    }

    pub fn clear(&mut self) {
        self.recipient = None;
        self.parse_body = false;
    }
}
