//! Channel session state
//!
//! A session binds one socket to one tenant-scoped topic and carries the
//! assigns the channel handlers read and update.

use crate::authorization::{AuthorizationContext, Policies};
use crate::tenant::tenant_topic;

/// Per-socket assigns for one joined channel
#[derive(Debug, Clone)]
pub struct Session {
    /// Owning tenant
    pub tenant_id: String,
    /// Channel topic as the client named it
    pub topic: String,
    /// Fan-out topic on the bus
    pub tenant_topic: String,
    /// Private channels gate work on probed policies
    pub private: bool,
    /// Whether the sender receives its own broadcasts
    pub self_broadcast: bool,
    /// Whether successful broadcasts are acked to the sender
    pub ack_broadcast: bool,
    /// Key this session tracks presence under
    pub presence_key: Option<String>,
    /// Presence handling can be disabled per channel
    pub presence_enabled: bool,
    /// Probed capabilities; starts all-unknown
    pub policies: Policies,
    /// Context passed to every authorization probe
    pub context: AuthorizationContext,
    /// This session's sink id on the bus, used for self-broadcast exclusion
    pub sink_id: u64,
}

impl Session {
    pub fn new(context: AuthorizationContext, private: bool, sink_id: u64) -> Self {
        let tenant_topic = tenant_topic(&context.tenant_id, &context.topic, private);
        Self {
            tenant_id: context.tenant_id.clone(),
            topic: context.topic.clone(),
            tenant_topic,
            private,
            self_broadcast: true,
            ack_broadcast: false,
            presence_key: None,
            presence_enabled: true,
            policies: Policies::default(),
            context,
            sink_id,
        }
    }
}
