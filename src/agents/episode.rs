//! Episode runner: pumps messages between the router and a team of agents.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::error::Result;
use crate::runtime::message::{AgentId, Message, Payload, Recipient, Role};
use crate::runtime::router::Router;

use super::Agent;

#[derive(Debug, Clone, Default)]
pub struct EpisodeReport {
    pub steps_taken: usize,
    pub messages_routed: usize,
    pub messages_handled: usize,
    pub last_summary_status: Option<String>,
    pub success: bool,
}

pub struct EpisodeRunner {
    episode_id: String,
    agents: HashMap<AgentId, Box<dyn Agent>>,
    router: Arc<Router>,
}

impl EpisodeRunner {
    pub fn new(
        episode_id: impl Into<String>,
        agents: Vec<Box<dyn Agent>>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            episode_id: episode_id.into(),
            agents: agents
                .into_iter()
                .map(|agent| (agent.id().to_string(), agent))
                .collect(),
            router,
        }
    }

    /// Run the episode: kick off the entry role, then dequeue → handle →
    /// route until the team goes quiet or `max_steps` elapse. Returned
    /// messages always re-enter through the router so stamping and topology
    /// rules apply to every hop.
    pub async fn run(&mut self, max_steps: usize) -> Result<EpisodeReport> {
        let mut report = EpisodeReport::default();

        let mut kickoff_fields = serde_json::Map::new();
        kickoff_fields.insert("action".into(), json!("kickoff"));
        let kickoff = Message::new(
            self.episode_id.clone(),
            "system",
            Recipient::agent(Role::CHAIN_ENTRY.as_str()),
            Payload::new(kickoff_fields)?,
        );
        if self.router.route(kickoff).is_admitted() {
            report.messages_routed += 1;
        }

        let agent_ids: Vec<AgentId> = self.agents.keys().cloned().collect();
        for step in 0..max_steps {
            report.steps_taken = step + 1;
            let mut handled_this_step = 0;

            for agent_id in &agent_ids {
                let Some(msg) = self.router.dequeue(agent_id) else {
                    continue;
                };
                handled_this_step += 1;
                report.messages_handled += 1;

                if let Some(status) = msg.payload.get_str("status") {
                    report.last_summary_status = Some(status.to_string());
                }

                let agent = self.agents.get_mut(agent_id).expect("agent present");
                for out in agent.handle(msg).await? {
                    if self.router.route(out).is_admitted() {
                        report.messages_routed += 1;
                    }
                }
            }

            if handled_this_step == 0 {
                let drained = self.router.queue_depths().values().all(|&d| d == 0);
                if drained {
                    // A switch may be holding traffic in Q_next; give a
                    // pending commit time to land before declaring quiet.
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    if self.router.queue_depths().values().all(|&d| d == 0) {
                        debug!(step, "episode quiescent");
                        break;
                    }
                }
            }
        }

        report.success = report.last_summary_status.as_deref() == Some("success");
        info!(
            episode = %self.episode_id,
            steps = report.steps_taken,
            handled = report.messages_handled,
            success = report.success,
            "episode finished"
        );
        Ok(report)
    }
}
