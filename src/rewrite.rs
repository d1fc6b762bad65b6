use tracing::debug;

use crate::error::FilterError;
use crate::session::{RecipientIdentity, SessionState};
use crate::transaction::Transaction;

/// Pull the bare address out of `Display Name <user@domain>`.
///
/// Falls back to the input unchanged when there are no brackets or the
/// bracketed part has no `@`.
pub fn extract_address(value: &str) -> &str {
    if value.contains('<') && value.contains('>') {
        let segment = value.split('<').nth(1).unwrap_or_default();
        let candidate = segment.split('>').next().unwrap_or_default();
        if candidate.contains('@') {
            return candidate;
        }
    }
    value
}

/// Rewrite the transaction so the message goes out to `forward_to`.
///
/// Inputs are validated before anything is touched; on error neither the
/// transaction nor the session changes.
pub fn rewrite_for_forward<T: Transaction + ?Sized>(
    tx: &mut T,
    session: &mut SessionState,
    from: &str,
    forward_to: &str,
) -> Result<(), FilterError> {
    if from.trim().is_empty() || forward_to.trim().is_empty() {
        return Err(FilterError::InvalidAddress(
            "cannot forward without from and forwardTo".to_string(),
        ));
    }

    let bare = extract_address(forward_to);
    let target = match bare.split_once('@') {
        Some((local_part, domain)) if !local_part.is_empty() && !domain.is_empty() => {
            RecipientIdentity {
                local_part: local_part.to_string(),
                domain: domain.to_string(),
            }
        }
        _ => {
            return Err(FilterError::InvalidAddress(format!(
                "forwardTo has no usable address: {:?}",
                forward_to
            )))
        }
    };

    let recipient = session.recipient_mut().ok_or(FilterError::InternalOrdering)?;

    tx.remove_header("From");
    tx.add_header("From", from);
    tx.set_mail_from(bare);
    tx.remove_header("Reply-To");
    tx.remove_header("Sender");
    tx.remove_header("To");
    tx.add_header("To", forward_to);

    debug!(
        original = %recipient,
        forward_to = %target,
        "Rewriting envelope recipient"
    );
    *recipient = target;

    Ok(())
}
