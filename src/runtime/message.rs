//! Message types for inter-agent communication.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ApexError, Result};

/// Hard payload size guard, enforced at construction.
pub const PAYLOAD_MAX_BYTES: usize = 512 * 1024;

/// Payload key carrying the true recipient of a hub-relayed Star message.
pub const FORWARD_TO_KEY: &str = "forward_to";

pub type AgentId = String;
pub type Epoch = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    Star,
    Chain,
    Flat,
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Star => "star",
            Self::Chain => "chain",
            Self::Flat => "flat",
        }
    }
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of team roles. Agent ids are the lowercase role names;
/// any other sender id is treated as external (e.g. `system` kickoff).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Coder,
    Runner,
    Critic,
    Summarizer,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Planner,
        Role::Coder,
        Role::Runner,
        Role::Critic,
        Role::Summarizer,
    ];

    /// The Star hub.
    pub const HUB: Role = Role::Planner;

    /// Entry role for external senders under Chain.
    pub const CHAIN_ENTRY: Role = Role::Planner;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::Runner => "runner",
            Self::Critic => "critic",
            Self::Summarizer => "summarizer",
        }
    }

    pub fn parse(id: &str) -> Option<Role> {
        match id {
            "planner" => Some(Role::Planner),
            "coder" => Some(Role::Coder),
            "runner" => Some(Role::Runner),
            "critic" => Some(Role::Critic),
            "summarizer" => Some(Role::Summarizer),
            _ => None,
        }
    }

    /// Fixed Chain cycle: planner → coder → runner → critic → summarizer → planner.
    pub fn next_hop(&self) -> Role {
        match self {
            Self::Planner => Role::Coder,
            Self::Coder => Role::Runner,
            Self::Runner => Role::Critic,
            Self::Critic => Role::Summarizer,
            Self::Summarizer => Role::Planner,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target of a message at admission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Agent(AgentId),
    Broadcast,
    /// Flat fan-out list; bounded by `flat_fanout_limit` at admission.
    Many(Vec<AgentId>),
}

impl Recipient {
    pub fn agent(id: impl Into<AgentId>) -> Self {
        Self::Agent(id.into())
    }

    pub fn many<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        Self::Many(ids.into_iter().map(Into::into).collect())
    }
}

/// Delivery priority. The MVP dequeues strict FIFO; the field exists so
/// scheduling policies can be layered on without a wire change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Final,
    #[default]
    Draft,
    Critic,
}

/// Why a message was rejected at admission or dropped before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Expired,
    MaxAttempts,
    QueueFull,
    TopologyViolation,
    DedupDuplicate,
    InvalidPayload,
}

impl DropReason {
    pub const ALL: [DropReason; 6] = [
        DropReason::Expired,
        DropReason::MaxAttempts,
        DropReason::QueueFull,
        DropReason::TopologyViolation,
        DropReason::DedupDuplicate,
        DropReason::InvalidPayload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::MaxAttempts => "max_attempts",
            Self::QueueFull => "queue_full",
            Self::TopologyViolation => "topology_violation",
            Self::DedupDuplicate => "dedup_duplicate",
            Self::InvalidPayload => "invalid_payload",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque payload map, size-bounded at construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload {
    fields: Map<String, Value>,
}

impl Payload {
    pub fn new(fields: Map<String, Value>) -> Result<Self> {
        let payload = Self { fields };
        let size = payload.encoded_len();
        if size > PAYLOAD_MAX_BYTES {
            return Err(ApexError::PayloadTooLarge {
                size,
                max: PAYLOAD_MAX_BYTES,
            });
        }
        Ok(payload)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Serialized size in bytes; the admission bound applies to this.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(&self.fields).map(|v| v.len()).unwrap_or(0)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// Core message value. The Router owns a message between `route` and
/// `dequeue`; retry mutates `attempt`, `redelivered`, and `drop_reason`.
#[derive(Debug, Clone)]
pub struct Message {
    pub episode_id: String,
    pub msg_id: String,
    pub sender: AgentId,
    pub recipient: Recipient,
    /// Stamped authoritatively by the Router at ingress; the value supplied
    /// by the sender is provisional.
    pub topo_epoch: Epoch,
    pub priority: Priority,
    pub payload: Payload,
    pub attempt: u32,
    pub created_ts: Instant,
    pub expires_ts: Option<Instant>,
    pub redelivered: bool,
    pub drop_reason: Option<DropReason>,
}

impl Message {
    pub fn new(
        episode_id: impl Into<String>,
        sender: impl Into<AgentId>,
        recipient: Recipient,
        payload: Payload,
    ) -> Self {
        Self {
            episode_id: episode_id.into(),
            msg_id: Uuid::new_v4().simple().to_string(),
            sender: sender.into(),
            recipient,
            topo_epoch: 0,
            priority: Priority::default(),
            payload,
            attempt: 0,
            created_ts: Instant::now(),
            expires_ts: None,
            redelivered: false,
            drop_reason: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expiry(mut self, expires_ts: Instant) -> Self {
        self.expires_ts = Some(expires_ts);
        self
    }

    /// Key scoping dedup and retry identity.
    pub fn dedup_key(&self) -> (String, String) {
        (self.episode_id.clone(), self.msg_id.clone())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_ts.is_some_and(|expiry| now > expiry)
    }
}
