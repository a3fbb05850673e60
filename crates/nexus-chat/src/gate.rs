//! Human-in-the-loop approval of generated queries
//!
//! A message paused at `pending_approval` leaves it one of two ways:
//! approval moves it to `executing` and the caller opens a resume stream
//! that appends to the same message; rejection ends it locally as `error`
//! without touching the network.

use crate::{
    error::{Error, Result},
    message::{Message, MessageStatus},
    placeholder::{REJECTED_NOTE, ensure_sql_placeholder, push_final_line},
};

/// Approve a paused message, returning the query text to submit.
///
/// An edited query replaces the proposed one and is submitted verbatim.
pub fn begin_approval(msg: &mut Message, edited_query: Option<&str>) -> Result<String> {
    if msg.status != MessageStatus::PendingApproval {
        return Err(Error::NotPendingApproval { status: msg.status });
    }

    let query = match edited_query {
        Some(edited) if !edited.trim().is_empty() => edited.to_string(),
        _ => msg
            .sql_query
            .clone()
            .ok_or_else(|| Error::Other("No query to approve".to_string()))?,
    };

    msg.sql_query = Some(query.clone());
    ensure_sql_placeholder(&mut msg.content);
    msg.status = MessageStatus::Executing;
    msg.error = None;
    tracing::debug!("Message {} approved", msg.id);
    Ok(query)
}

/// Reject a paused message. Purely local.
pub fn reject(msg: &mut Message) -> Result<()> {
    if msg.status != MessageStatus::PendingApproval {
        return Err(Error::NotPendingApproval { status: msg.status });
    }
    push_final_line(&mut msg.content, REJECTED_NOTE);
    msg.status = MessageStatus::Error;
    msg.error = Some("Query rejected".to_string());
    tracing::debug!("Message {} rejected", msg.id);
    Ok(())
}
