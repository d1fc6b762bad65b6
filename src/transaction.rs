use std::collections::BTreeSet;

use crate::error::FilterError;
use crate::message::MessageDocument;
use crate::milter::Modification;

/// The live SMTP transaction as seen by the decision stages.
pub trait Transaction {
    /// Hand out the full raw message. Succeeds exactly once per transaction.
    fn drain_message(&mut self) -> Result<MessageDocument, FilterError>;

    /// Remove every occurrence of a header. Names compare case-insensitively.
    fn remove_header(&mut self, name: &str);

    fn add_header(&mut self, name: &str, value: &str);

    fn set_mail_from(&mut self, address: &str);
}

/// Transaction backed by the milter event stream.
///
/// Headers and body arrive as separate events and are buffered here. Edits
/// are recorded against the headers the MTA sent and turned into milter
/// modification actions at end of message.
#[derive(Debug, Default)]
pub struct MilterTransaction {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    drained: bool,
    removed: BTreeSet<String>,
    added: Vec<(String, String)>,
    mail_from: Option<String>,
}

impl MilterTransaction {
    pub fn push_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn push_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    pub fn mail_from(&self) -> Option<&str> {
        self.mail_from.as_deref()
    }

    /// Headers as they will look once the MTA applies the modifications.
    #[cfg(test)]
    pub fn headers(&self) -> Vec<(&str, &str)> {
        self.headers
            .iter()
            .filter(|(name, _)| !self.removed.contains(&name.to_ascii_lowercase()))
            .chain(self.added.iter())
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect()
    }

    #[cfg(test)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers()
            .into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Milter actions reproducing the recorded edits.
    ///
    /// Deletions address the n-th occurrence of a header name and are
    /// emitted last-to-first so earlier indices stay valid.
    pub fn modifications(&self) -> Vec<Modification> {
        let mut mods = Vec::new();

        for name in &self.removed {
            let occurrences: Vec<&str> = self
                .headers
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(n, _)| n.as_str())
                .collect();

            for (i, header_name) in occurrences.iter().enumerate().rev() {
                mods.push(Modification::ChangeHeader {
                    index: (i + 1) as u32,
                    name: header_name.to_string(),
                    value: String::new(),
                });
            }
        }

        for (name, value) in &self.added {
            mods.push(Modification::AddHeader {
                name: name.clone(),
                value: value.clone(),
            });
        }

        if let Some(from) = &self.mail_from {
            mods.push(Modification::ChangeFrom(format!("<{}>", from)));
        }

        mods
    }
}

impl Transaction for MilterTransaction {
    fn drain_message(&mut self) -> Result<MessageDocument, FilterError> {
        if self.drained {
            return Err(FilterError::StreamConsumed);
        }
        self.drained = true;

        let body = std::mem::take(&mut self.body);
        Ok(MessageDocument::from_parts(
            self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str())),
            &body,
        ))
    }

    fn remove_header(&mut self, name: &str) {
        self.removed.insert(name.to_ascii_lowercase());
        self.added.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    fn add_header(&mut self, name: &str, value: &str) {
        self.added.push((name.to_string(), value.to_string()));
    }

    fn set_mail_from(&mut self, address: &str) {
        self.mail_from = Some(address.to_string());
    }
}
