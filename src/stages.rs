use tracing::{error, info};

use crate::error::FilterError;
use crate::policy::{ForwardDirective, PolicyClient};
use crate::rewrite::rewrite_for_forward;
use crate::session::{RecipientIdentity, SessionState};
use crate::transaction::Transaction;

/// Decision handed back to the MTA for a recipient or a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Permanent rejection.
    Deny,
    /// Temporary failure; the sender is expected to retry.
    SoftDeny,
}

/// RCPT phase: ask the existence endpoint about the recipient.
///
/// Only the first argument is looked at; anything after it is ignored.
/// The session changes only when the recipient is accepted.
pub async fn on_rcpt<P: PolicyClient + ?Sized>(
    policy: &P,
    session: &mut SessionState,
    ctx_id: &str,
    args: &[String],
) -> Verdict {
    match check_recipient(policy, args).await {
        Ok(Some(recipient)) => {
            info!(ctx_id = %ctx_id, recipient = %recipient, "Recipient accepted");
            session.accept_recipient(recipient);
            Verdict::Accept
        }
        Ok(None) => Verdict::Deny,
        Err(e) => {
            error!(ctx_id = %ctx_id, args = ?args, error = %e, "Recipient check failed");
            Verdict::SoftDeny
        }
    }
}

async fn check_recipient<P: PolicyClient + ?Sized>(
    policy: &P,
    args: &[String],
) -> Result<Option<RecipientIdentity>, FilterError> {
    let first = args
        .first()
        .ok_or_else(|| FilterError::InvalidInput("RCPT without recipient".to_string()))?;
    let recipient = RecipientIdentity::parse(first)?;

    if policy.check_exists(&recipient.address()).await? {
        Ok(Some(recipient))
    } else {
        info!(recipient = %recipient, "Recipient does not exist, denying");
        Ok(None)
    }
}

/// End of message: ask the forward endpoint what to do with the message and
/// rewrite the transaction when it should be forwarded.
pub async fn on_data_post<P, T>(
    policy: &P,
    session: &mut SessionState,
    tx: &mut T,
    ctx_id: &str,
) -> Verdict
where
    P: PolicyClient + ?Sized,
    T: Transaction + ?Sized,
{
    match decide_forward(policy, session, tx, ctx_id).await {
        Ok(verdict) => verdict,
        Err(e) => {
            error!(ctx_id = %ctx_id, error = %e, "Forward check failed");
            Verdict::SoftDeny
        }
    }
}

async fn decide_forward<P, T>(
    policy: &P,
    session: &mut SessionState,
    tx: &mut T,
    ctx_id: &str,
) -> Result<Verdict, FilterError>
where
    P: PolicyClient + ?Sized,
    T: Transaction + ?Sized,
{
    let email = session
        .recipient()
        .map(RecipientIdentity::address)
        .ok_or(FilterError::InternalOrdering)?;

    let document = tx.drain_message()?;
    info!(
        ctx_id = %ctx_id,
        recipient = %email,
        size = document.len(),
        message_id = ?document.message_id(),
        "Checking forward policy"
    );

    match policy.check_forward(&email, &document).await? {
        ForwardDirective::Reject => {
            info!(ctx_id = %ctx_id, recipient = %email, "Forward refused, denying message");
            Ok(Verdict::Deny)
        }
        ForwardDirective::Forward { forward_to, from } => {
            info!(
                ctx_id = %ctx_id,
                recipient = %email,
                forward_to = %forward_to,
                from = %from,
                "Forwarding message"
            );
            rewrite_for_forward(tx, session, &from, &forward_to)?;
            Ok(Verdict::Accept)
        }
    }
}
