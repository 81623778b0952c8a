//! Broadcast handler
//!
//! Gates a client broadcast on the session's write capability, publishes the
//! envelope on the tenant topic and credits the tenant's events counter.

use serde_json::Value;
use tracing::debug;

use crate::authorization::{AuthError, Authorizer, Direction};
use crate::bus::{Bus, Envelope};
use crate::channel::{write_gate, Gate, Reply};
use crate::counters::{CounterKind, RateCounters};
use crate::session::Session;

/// Handle one inbound broadcast from the session's client.
///
/// On a private channel with an unknown write capability, exactly one write
/// probe runs and its result is merged into the session before the gate is
/// re-evaluated; the capability is a terminal boolean afterwards, so later
/// messages on this session never probe again.
pub async fn handle(
    payload: Value,
    auth: &dyn Authorizer,
    bus: &Bus,
    counters: &RateCounters,
    session: &mut Session,
) -> Result<Reply, AuthError> {
    counters.add(&session.tenant_id, CounterKind::RequestsPerSecond, 1);

    loop {
        match write_gate(session.private, session.policies.broadcast.write) {
            Gate::Allow => {
                let envelope = Envelope::broadcast(&session.topic, payload);
                let exclude = if session.self_broadcast {
                    None
                } else {
                    Some(session.sink_id)
                };
                bus.publish(&session.tenant_topic, &envelope, exclude);
                counters.add(&session.tenant_id, CounterKind::EventsPerSecond, 1);

                return Ok(if session.ack_broadcast {
                    Reply::Ok
                } else {
                    Reply::NoReply
                });
            }
            Gate::Block => {
                debug!(
                    tenant = %session.tenant_id,
                    topic = %session.topic,
                    "broadcast dropped, write capability denied"
                );
                return Ok(Reply::NoReply);
            }
            Gate::Probe => match auth.probe(Direction::Write, &session.context).await {
                Ok(probed) => {
                    session.policies.merge_direction(Direction::Write, &probed);
                }
                Err(AuthError::RlsPolicy(e)) => {
                    session.policies.latch_denied(Direction::Write);
                    return Err(AuthError::RlsPolicy(e));
                }
                Err(e) => return Err(e),
            },
        }
    }
}
