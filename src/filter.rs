use std::sync::Arc;
use tracing::{debug, info};

use crate::milter::{MilterCallbacks, MilterResult, Modification};
use crate::policy::PolicyClient;
use crate::session::SessionState;
use crate::stages::{self, Verdict};
use crate::transaction::MilterTransaction;

/// Everything one MTA connection carries between events. Reset whenever a
/// transaction ends or a new one starts.
#[derive(Debug, Default)]
pub struct ConnectionState {
    session: SessionState,
    tx: MilterTransaction,
    /// RCPT argument of the accepted recipient, as the MTA knows it.
    envelope_rcpt: Option<String>,
}

impl ConnectionState {
    fn reset(&mut self) {
        self.session.clear();
        self.tx = MilterTransaction::default();
        self.envelope_rcpt = None;
    }
}

#[derive(Clone)]
pub struct ForwardMilter {
    policy: Arc<dyn PolicyClient>,
}

impl ForwardMilter {
    pub fn new(policy: Arc<dyn PolicyClient>) -> Self {
        Self { policy }
    }
}

fn milter_result(verdict: Verdict) -> MilterResult {
    match verdict {
        Verdict::Accept => MilterResult::Continue,
        Verdict::Deny => MilterResult::Reject,
        Verdict::SoftDeny => MilterResult::TempFail,
    }
}

#[async_trait::async_trait]
impl MilterCallbacks for ForwardMilter {
    type Session = ConnectionState;

    async fn connect(
        &self,
        _state: &mut ConnectionState,
        ctx_id: &str,
        hostname: &str,
        addr: &str,
    ) -> MilterResult {
        info!(ctx_id = %ctx_id, hostname = %hostname, addr = %addr, "New connection");
        MilterResult::Continue
    }

    async fn mail_from(&self, state: &mut ConnectionState, ctx_id: &str, args: &[String]) -> MilterResult {
        state.reset();
        debug!(ctx_id = %ctx_id, sender = ?args.first(), "New transaction");
        MilterResult::Continue
    }

    async fn rcpt_to(&self, state: &mut ConnectionState, ctx_id: &str, args: &[String]) -> MilterResult {
        let verdict = stages::on_rcpt(&*self.policy, &mut state.session, ctx_id, args).await;
        if verdict == Verdict::Accept {
            state.envelope_rcpt = args.first().cloned();
        }
        milter_result(verdict)
    }

    async fn header(&self, state: &mut ConnectionState, _ctx_id: &str, name: &str, value: &str) -> MilterResult {
        if state.session.parse_body() {
            state.tx.push_header(name, value);
        }
        MilterResult::Continue
    }

    async fn body(&self, state: &mut ConnectionState, _ctx_id: &str, chunk: &[u8]) -> MilterResult {
        if state.session.parse_body() {
            state.tx.push_body(chunk);
        }
        MilterResult::Continue
    }

    async fn end_of_message(&self, state: &mut ConnectionState, ctx_id: &str) -> (Vec<Modification>, MilterResult) {
        let original = state.session.recipient().cloned();
        debug!(ctx_id = %ctx_id, body_size = state.tx.body_len(), "Message received");

        let verdict =
            stages::on_data_post(&*self.policy, &mut state.session, &mut state.tx, ctx_id).await;

        let outcome = match verdict {
            Verdict::Accept => {
                let mut modifications = state.tx.modifications();

                // Re-route the envelope when the recipient was rewritten
                if let (Some(before), Some(after), Some(rcpt)) =
                    (original, state.session.recipient(), state.envelope_rcpt.as_ref())
                {
                    if before != *after {
                        modifications.push(Modification::DeleteRecipient(rcpt.clone()));
                        modifications.push(Modification::AddRecipient(format!("<{}>", after)));
                    }
                }

                info!(
                    ctx_id = %ctx_id,
                    mail_from = ?state.tx.mail_from(),
                    modifications = modifications.len(),
                    "Message accepted"
                );
                (modifications, MilterResult::Accept)
            }
            Verdict::Deny => (Vec::new(), MilterResult::Reject),
            Verdict::SoftDeny => (Vec::new(), MilterResult::TempFail),
        };

        state.reset();
        outcome
    }

    async fn abort(&self, state: &mut ConnectionState, ctx_id: &str) {
        debug!(ctx_id = %ctx_id, "Transaction aborted");
        state.reset();
    }

    async fn close(&self, state: &mut ConnectionState, ctx_id: &str) {
        debug!(ctx_id = %ctx_id, "Connection closed");
        state.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilterError;
    use crate::message::MessageDocument;
    use crate::policy::ForwardDirective;

    struct StaticPolicy {
        exists: Result<bool, ()>,
        forward: Result<ForwardDirective, ()>,
    }

    #[async_trait::async_trait]
    impl PolicyClient for StaticPolicy {
        async fn check_exists(&self, _email: &str) -> Result<bool, FilterError> {
            self.exists
                .map_err(|_| FilterError::Network("connection refused".to_string()))
        }

        async fn check_forward(
            &self,
            _email: &str,
            _message: &MessageDocument,
        ) -> Result<ForwardDirective, FilterError> {
            self.forward
                .clone()
                .map_err(|_| FilterError::Protocol("not json".to_string()))
        }
    }

    fn milter(exists: Result<bool, ()>, forward: Result<ForwardDirective, ()>) -> ForwardMilter {
        ForwardMilter::new(Arc::new(StaticPolicy { exists, forward }))
    }

    fn forward_to_b() -> Result<ForwardDirective, ()> {
        Ok(ForwardDirective::Forward {
            forward_to: "B <b@y.com>".to_string(),
            from: "A <a@x.com>".to_string(),
        })
    }

    async fn deliver(milter: &ForwardMilter, state: &mut ConnectionState) -> (Vec<Modification>, MilterResult) {
        let ctx = "ctx";
        milter.mail_from(state, ctx, &["<s@origin.com>".to_string()]).await;
        let rcpt = milter.rcpt_to(state, ctx, &["<alias@relay.com>".to_string()]).await;
        assert_eq!(rcpt, MilterResult::Continue);
        milter.header(state, ctx, "From", "s@origin.com").await;
        milter.header(state, ctx, "To", "alias@relay.com").await;
        milter.header(state, ctx, "Reply-To", "r@origin.com").await;
        milter.body(state, ctx, b"Hello\r\n").await;
        milter.end_of_message(state, ctx).await
    }

    #[tokio::test]
    async fn test_forward_emits_header_and_envelope_changes() {
        let milter = milter(Ok(true), forward_to_b());
        let mut state = ConnectionState::default();

        let (mods, result) = deliver(&milter, &mut state).await;

        assert_eq!(result, MilterResult::Accept);
        assert_eq!(
            mods,
            vec![
                Modification::ChangeHeader {
                    index: 1,
                    name: "From".to_string(),
                    value: String::new(),
                },
                Modification::ChangeHeader {
                    index: 1,
                    name: "Reply-To".to_string(),
                    value: String::new(),
                },
                Modification::ChangeHeader {
                    index: 1,
                    name: "To".to_string(),
                    value: String::new(),
                },
                Modification::AddHeader {
                    name: "From".to_string(),
                    value: "A <a@x.com>".to_string(),
                },
                Modification::AddHeader {
                    name: "To".to_string(),
                    value: "B <b@y.com>".to_string(),
                },
                Modification::ChangeFrom("<b@y.com>".to_string()),
                Modification::DeleteRecipient("<alias@relay.com>".to_string()),
                Modification::AddRecipient("<b@y.com>".to_string()),
            ]
        );
        assert!(state.session.recipient().is_none());
    }

    #[tokio::test]
    async fn test_forward_to_same_recipient_keeps_envelope() {
        let milter = milter(
            Ok(true),
            Ok(ForwardDirective::Forward {
                forward_to: "alias@relay.com".to_string(),
                from: "a@x.com".to_string(),
            }),
        );
        let mut state = ConnectionState::default();

        let (mods, result) = deliver(&milter, &mut state).await;

        assert_eq!(result, MilterResult::Accept);
        assert!(!mods
            .iter()
            .any(|m| matches!(m, Modification::DeleteRecipient(_) | Modification::AddRecipient(_))));
    }

    #[tokio::test]
    async fn test_refused_forward_rejects() {
        let milter = milter(Ok(true), Ok(ForwardDirective::Reject));
        let mut state = ConnectionState::default();

        assert_eq!(deliver(&milter, &mut state).await, (Vec::new(), MilterResult::Reject));
    }

    #[tokio::test]
    async fn test_policy_failure_tempfails() {
        let milter = milter(Ok(true), Err(()));
        let mut state = ConnectionState::default();

        assert_eq!(deliver(&milter, &mut state).await, (Vec::new(), MilterResult::TempFail));
    }

    #[tokio::test]
    async fn test_rcpt_outcomes() {
        let mut state = ConnectionState::default();
        let args = vec!["<alias@relay.com>".to_string()];

        let unknown = milter(Ok(false), Err(()));
        assert_eq!(unknown.rcpt_to(&mut state, "ctx", &args).await, MilterResult::Reject);
        let down = milter(Err(()), Err(()));
        assert_eq!(down.rcpt_to(&mut state, "ctx", &args).await, MilterResult::TempFail);
        assert!(state.envelope_rcpt.is_none());
        assert!(!state.session.parse_body());
    }

    #[tokio::test]
    async fn test_body_ignored_until_recipient_accepted() {
        let milter = milter(Ok(false), forward_to_b());
        let mut state = ConnectionState::default();

        milter.header(&mut state, "ctx", "Subject", "Hi").await;
        milter.body(&mut state, "ctx", b"Hello").await;

        assert_eq!(state.tx.body_len(), 0);
        assert!(state.tx.headers().is_empty());
    }

    #[tokio::test]
    async fn test_end_of_message_without_recipient_tempfails() {
        let milter = milter(Ok(true), forward_to_b());
        let mut state = ConnectionState::default();

        milter.mail_from(&mut state, "ctx", &["<s@origin.com>".to_string()]).await;
        let (mods, result) = milter.end_of_message(&mut state, "ctx").await;

        assert!(mods.is_empty());
        assert_eq!(result, MilterResult::TempFail);
    }

    #[tokio::test]
    async fn test_new_transaction_clears_recipient() {
        let milter = milter(Ok(true), forward_to_b());
        let mut state = ConnectionState::default();

        milter.rcpt_to(&mut state, "ctx", &["<alias@relay.com>".to_string()]).await;
        assert!(state.session.recipient().is_some());

        milter.mail_from(&mut state, "ctx", &["<t@origin.com>".to_string()]).await;
        assert!(state.session.recipient().is_none());
        assert!(state.envelope_rcpt.is_none());
    }
}
