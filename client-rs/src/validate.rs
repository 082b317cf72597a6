//! Envelope validation
//!
//! Every envelope that crosses a transport, including in-process links, passes
//! through [`validate`] before it reaches a scope. Typed decoding already
//! enforces the wire shape; on top of that an entry naming an empty channel or
//! signal id cannot be routed and is removed. Only the offending entry goes,
//! the rest of the envelope is still delivered.

use thiserror::Error;

use crate::messages::Envelope;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} id is empty")]
    EmptyId(&'static str),
}

/// Check a channel or signal id before it is queued
pub fn check_id(kind: &'static str, id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyId(kind));
    }
    Ok(())
}

/// Strip unroutable entries from `envelope`, returning why each one went
///
/// Labels and event names are free-form, empty ones included.
pub fn validate(envelope: &mut Envelope) -> Vec<ValidationError> {
    let mut rejected = Vec::new();

    envelope.mod_subscribe.retain(|channel, _| match check_id("channel", channel) {
        Ok(()) => true,
        Err(e) => {
            rejected.push(e);
            false
        }
    });

    envelope.calls.retain(|call| match check_id("channel", &call.channel) {
        Ok(()) => true,
        Err(e) => {
            rejected.push(e);
            false
        }
    });

    envelope.signals.retain(|id, _| match check_id("signal", id) {
        Ok(()) => true,
        Err(e) => {
            rejected.push(e);
            false
        }
    });

    rejected
}
