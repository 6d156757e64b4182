//! Scripted role agents.
//!
//! Deterministic stand-ins for LLM-backed roles, driving the canonical
//! plan → patch → test → verdict → summary flow. Each agent addresses the
//! pipeline-next role; the router's topology rules decide how the message
//! actually travels (direct, via hub, or as a bounded fan-out). The planner
//! doubles as the Star hub and relays messages carrying a forward hint.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::runtime::message::{Message, Payload, Recipient, Role, Topology, FORWARD_TO_KEY};

use super::Agent;

const ACTION_KEY: &str = "action";

pub struct ScriptedAgent {
    role: Role,
    episode_id: String,
    coordinator: Arc<Coordinator>,
    handled: u64,
}

impl ScriptedAgent {
    pub fn new(role: Role, episode_id: impl Into<String>, coordinator: Arc<Coordinator>) -> Self {
        Self {
            role,
            episode_id: episode_id.into(),
            coordinator,
            handled: 0,
        }
    }

    pub fn handled(&self) -> u64 {
        self.handled
    }

    fn outgoing(&self, to: Role, mut fields: serde_json::Map<String, Value>) -> Result<Message> {
        // Provisional epoch; the router stamps authoritatively at ingress.
        let topology = self.coordinator.active().topology;
        let recipient = match topology {
            Topology::Flat => Recipient::many([to.as_str()]),
            Topology::Star | Topology::Chain => Recipient::agent(to.as_str()),
        };
        fields.insert("from_role".into(), json!(self.role.as_str()));
        Ok(Message::new(
            self.episode_id.clone(),
            self.role.as_str(),
            recipient,
            Payload::new(fields)?,
        ))
    }

    fn respond(&self, action: &str, extra: serde_json::Map<String, Value>) -> Result<Vec<Message>> {
        let mut fields = extra;
        fields.insert(ACTION_KEY.into(), json!(action));
        Ok(vec![self.outgoing(self.role.next_hop(), fields)?])
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        self.role.as_str()
    }

    async fn handle(&mut self, msg: Message) -> Result<Vec<Message>> {
        self.handled += 1;

        // Hub relay: under Star, spoke-to-spoke traffic reaches the hub
        // with a forward hint; pass it along to its true recipient.
        if self.role == Role::HUB {
            if let Some(target) = msg.payload.get_str(FORWARD_TO_KEY) {
                let target = target.to_string();
                let mut fields = msg.payload.fields().clone();
                fields.remove(FORWARD_TO_KEY);
                debug!(to = %target, "hub relaying forwarded message");
                let relayed = Message::new(
                    self.episode_id.clone(),
                    self.role.as_str(),
                    Recipient::agent(target),
                    Payload::new(fields)?,
                );
                return Ok(vec![relayed]);
            }
        }

        let action = msg.payload.get_str(ACTION_KEY).unwrap_or_default();
        match (self.role, action) {
            (Role::Planner, "kickoff") => {
                let mut fields = serde_json::Map::new();
                fields.insert("plan".into(), json!(["implement", "test", "review"]));
                self.respond("plan", fields)
            }
            (Role::Planner, "summary") => {
                // Episode closed; nothing further to emit.
                Ok(Vec::new())
            }
            (Role::Coder, "plan") => {
                let mut fields = serde_json::Map::new();
                fields.insert(
                    "patch".into(),
                    json!("- placeholder\n+ implementation\n"),
                );
                self.respond("patch", fields)
            }
            (Role::Runner, "patch") => {
                let mut fields = serde_json::Map::new();
                fields.insert("passed".into(), json!(5));
                fields.insert("failed".into(), json!(0));
                self.respond("test_report", fields)
            }
            (Role::Critic, "test_report") => {
                let approved = msg
                    .payload
                    .get("failed")
                    .and_then(Value::as_u64)
                    .is_some_and(|failed| failed == 0);
                let mut fields = serde_json::Map::new();
                fields.insert("approved".into(), json!(approved));
                self.respond("verdict", fields)
            }
            (Role::Summarizer, "verdict") => {
                let approved = msg
                    .payload
                    .get("approved")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let mut fields = serde_json::Map::new();
                fields.insert(
                    "status".into(),
                    json!(if approved { "success" } else { "failure" }),
                );
                self.respond("summary", fields)
            }
            _ => {
                debug!(role = %self.role, action, "no scripted reaction");
                Ok(Vec::new())
            }
        }
    }
}
