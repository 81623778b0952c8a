//! Channel-side handlers
//!
//! Per-session logic for `broadcast` and `presence` events. Handlers consult
//! the authorization engine, feed the tenant rate counters and publish via
//! the bus; they never decide on overload themselves.

pub mod broadcast;
pub mod presence;

use crate::authorization::Decision;

/// Handler outcome, mirrored to the socket layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Nothing goes back to the client
    NoReply,
    /// Positive ack
    Ok,
    /// Negative ack
    Error,
}

/// What the write gate says for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
    Allow,
    Block,
    /// Capability unknown: run one write probe, then re-evaluate
    Probe,
}

/// Public channels are always writable; private channels follow the probed
/// capability, with `Unknown` meaning "probe needed", never "deny".
pub(crate) fn write_gate(private: bool, decision: Decision) -> Gate {
    if !private {
        return Gate::Allow;
    }
    match decision {
        Decision::Granted => Gate::Allow,
        Decision::Denied => Gate::Block,
        Decision::Unknown => Gate::Probe,
    }
}
