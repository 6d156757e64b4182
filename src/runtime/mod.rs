pub mod clock;
pub mod dedup;
pub mod guard;
pub mod intent_log;
pub mod message;
pub mod router;
pub mod switch;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use guard::{RoutingIntent, TopologyGuard, TopologyViolation};
pub use intent_log::{IntentLog, IntentRecord};
pub use message::{
    AgentId, DropReason, Epoch, Message, Payload, Priority, Recipient, Role, Topology,
    FORWARD_TO_KEY, PAYLOAD_MAX_BYTES,
};
pub use router::{RetryOutcome, RouteOutcome, Router};
pub use switch::{PrepareTask, SwitchEngine, SwitchOutcome, SwitchStats};
