//! Topology admission rules.
//!
//! `TopologyGuard::validate` is a pure function from
//! `(topology, sender, recipient)` to a routing intent; it never touches
//! Router state. Centralizing the rules here keeps rule changes atomic and
//! testable in isolation.

use crate::runtime::message::{AgentId, Recipient, Role, Topology};

/// How an admitted message should be materialized into queue appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingIntent {
    /// Deliver to a single mailbox.
    Direct { to: AgentId },
    /// Star spoke-to-spoke: rewrite to one message for the hub carrying a
    /// `forward_to` hint. Never duplicates.
    ViaHub { hub: AgentId, forward_to: AgentId },
    /// One copy per recipient, each with a fresh msg_id.
    Fanout { to: Vec<AgentId> },
}

/// Rule violations surfaced as `topology_violation` rejections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyViolation {
    /// Chain requires `recipient == next_hop(sender)`.
    NotNextHop { expected: AgentId },
    /// External senders must enter the chain at the entry role.
    BadChainEntry,
    /// Broadcast is not admissible for this (topology, sender).
    BroadcastNotAllowed,
    /// Flat fan-out list exceeds the configured bound.
    FanoutExceeded { requested: usize, limit: usize },
    /// Flat requires an explicit recipients list.
    RecipientsListRequired,
    /// Recipient id is not a known role.
    UnknownRecipient { id: AgentId },
    /// Empty fan-out list.
    EmptyRecipients,
}

pub struct TopologyGuard {
    fanout_limit: usize,
}

impl TopologyGuard {
    pub fn new(fanout_limit: usize) -> Self {
        Self { fanout_limit }
    }

    pub fn validate(
        &self,
        topology: Topology,
        sender: &AgentId,
        recipient: &Recipient,
    ) -> Result<RoutingIntent, TopologyViolation> {
        match topology {
            Topology::Star => self.validate_star(sender, recipient),
            Topology::Chain => self.validate_chain(sender, recipient),
            Topology::Flat => self.validate_flat(recipient),
        }
    }

    /// Star: everything flows through the hub. A spoke-to-spoke send becomes
    /// a single hub delivery with a forward hint; only the hub may broadcast.
    fn validate_star(
        &self,
        sender: &AgentId,
        recipient: &Recipient,
    ) -> Result<RoutingIntent, TopologyViolation> {
        let hub = Role::HUB.as_str();
        match recipient {
            Recipient::Agent(to) => {
                Self::require_known(to)?;
                if sender == hub || to == hub {
                    Ok(RoutingIntent::Direct { to: to.clone() })
                } else {
                    Ok(RoutingIntent::ViaHub {
                        hub: hub.to_string(),
                        forward_to: to.clone(),
                    })
                }
            }
            Recipient::Broadcast => {
                if sender == hub {
                    Ok(RoutingIntent::Fanout {
                        to: Self::all_except(sender),
                    })
                } else {
                    Err(TopologyViolation::BroadcastNotAllowed)
                }
            }
            Recipient::Many(_) => Err(TopologyViolation::BroadcastNotAllowed),
        }
    }

    /// Chain: strict next-hop along the fixed cycle; external senders enter
    /// at the entry role; no broadcast.
    fn validate_chain(
        &self,
        sender: &AgentId,
        recipient: &Recipient,
    ) -> Result<RoutingIntent, TopologyViolation> {
        let to = match recipient {
            Recipient::Agent(to) => to,
            Recipient::Broadcast | Recipient::Many(_) => {
                return Err(TopologyViolation::BroadcastNotAllowed);
            }
        };
        Self::require_known(to)?;

        match Role::parse(sender) {
            Some(role) => {
                let expected = role.next_hop().as_str();
                if to == expected {
                    Ok(RoutingIntent::Direct { to: to.clone() })
                } else {
                    Err(TopologyViolation::NotNextHop {
                        expected: expected.to_string(),
                    })
                }
            }
            None => {
                // External sender: only the chain entry accepts ingress.
                if to == Role::CHAIN_ENTRY.as_str() {
                    Ok(RoutingIntent::Direct { to: to.clone() })
                } else {
                    Err(TopologyViolation::BadChainEntry)
                }
            }
        }
    }

    /// Flat: peer-to-peer with bounded fan-out; a recipients list is
    /// required (a single `Agent` target counts as a list of one).
    fn validate_flat(&self, recipient: &Recipient) -> Result<RoutingIntent, TopologyViolation> {
        let targets: Vec<AgentId> = match recipient {
            Recipient::Many(list) => list.clone(),
            Recipient::Agent(to) => vec![to.clone()],
            Recipient::Broadcast => return Err(TopologyViolation::RecipientsListRequired),
        };

        if targets.is_empty() {
            return Err(TopologyViolation::EmptyRecipients);
        }
        if targets.len() > self.fanout_limit {
            return Err(TopologyViolation::FanoutExceeded {
                requested: targets.len(),
                limit: self.fanout_limit,
            });
        }
        for target in &targets {
            Self::require_known(target)?;
        }
        Ok(RoutingIntent::Fanout { to: targets })
    }

    fn require_known(id: &AgentId) -> Result<(), TopologyViolation> {
        if Role::parse(id).is_some() {
            Ok(())
        } else {
            Err(TopologyViolation::UnknownRecipient { id: id.clone() })
        }
    }

    fn all_except(sender: &AgentId) -> Vec<AgentId> {
        Role::ALL
            .iter()
            .map(|r| r.as_str().to_string())
            .filter(|id| id != sender)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> TopologyGuard {
        TopologyGuard::new(2)
    }

    #[test]
    fn test_star_spoke_to_spoke_rewrites_via_hub() {
        let intent = guard()
            .validate(
                Topology::Star,
                &"coder".to_string(),
                &Recipient::agent("runner"),
            )
            .unwrap();
        assert_eq!(
            intent,
            RoutingIntent::ViaHub {
                hub: "planner".into(),
                forward_to: "runner".into()
            }
        );
    }

    #[test]
    fn test_star_hub_sends_direct() {
        let intent = guard()
            .validate(
                Topology::Star,
                &"planner".to_string(),
                &Recipient::agent("coder"),
            )
            .unwrap();
        assert_eq!(intent, RoutingIntent::Direct { to: "coder".into() });
    }

    #[test]
    fn test_star_spoke_to_hub_direct() {
        let intent = guard()
            .validate(
                Topology::Star,
                &"critic".to_string(),
                &Recipient::agent("planner"),
            )
            .unwrap();
        assert_eq!(intent, RoutingIntent::Direct { to: "planner".into() });
    }

    #[test]
    fn test_star_only_hub_broadcasts() {
        assert!(guard()
            .validate(Topology::Star, &"coder".to_string(), &Recipient::Broadcast)
            .is_err());

        let intent = guard()
            .validate(Topology::Star, &"planner".to_string(), &Recipient::Broadcast)
            .unwrap();
        match intent {
            RoutingIntent::Fanout { to } => {
                assert_eq!(to.len(), 4);
                assert!(!to.contains(&"planner".to_string()));
            }
            other => panic!("expected fanout, got {:?}", other),
        }
    }

    #[test]
    fn test_chain_next_hop_enforced() {
        // coder → critic skips runner
        let err = guard()
            .validate(
                Topology::Chain,
                &"coder".to_string(),
                &Recipient::agent("critic"),
            )
            .unwrap_err();
        assert_eq!(
            err,
            TopologyViolation::NotNextHop {
                expected: "runner".into()
            }
        );

        let ok = guard()
            .validate(
                Topology::Chain,
                &"coder".to_string(),
                &Recipient::agent("runner"),
            )
            .unwrap();
        assert_eq!(ok, RoutingIntent::Direct { to: "runner".into() });
    }

    #[test]
    fn test_chain_external_sender_enters_at_planner() {
        let ok = guard()
            .validate(
                Topology::Chain,
                &"system".to_string(),
                &Recipient::agent("planner"),
            )
            .unwrap();
        assert_eq!(ok, RoutingIntent::Direct { to: "planner".into() });

        let err = guard()
            .validate(
                Topology::Chain,
                &"system".to_string(),
                &Recipient::agent("coder"),
            )
            .unwrap_err();
        assert_eq!(err, TopologyViolation::BadChainEntry);
    }

    #[test]
    fn test_chain_rejects_broadcast() {
        assert_eq!(
            guard()
                .validate(Topology::Chain, &"planner".to_string(), &Recipient::Broadcast)
                .unwrap_err(),
            TopologyViolation::BroadcastNotAllowed
        );
    }

    #[test]
    fn test_flat_fanout_bound() {
        let err = guard()
            .validate(
                Topology::Flat,
                &"planner".to_string(),
                &Recipient::many(["coder", "runner", "critic"]),
            )
            .unwrap_err();
        assert_eq!(
            err,
            TopologyViolation::FanoutExceeded {
                requested: 3,
                limit: 2
            }
        );

        let ok = guard()
            .validate(
                Topology::Flat,
                &"planner".to_string(),
                &Recipient::many(["coder", "runner"]),
            )
            .unwrap();
        assert_eq!(
            ok,
            RoutingIntent::Fanout {
                to: vec!["coder".into(), "runner".into()]
            }
        );
    }

    #[test]
    fn test_flat_single_agent_is_list_of_one() {
        let ok = guard()
            .validate(
                Topology::Flat,
                &"coder".to_string(),
                &Recipient::agent("critic"),
            )
            .unwrap();
        assert_eq!(
            ok,
            RoutingIntent::Fanout {
                to: vec!["critic".into()]
            }
        );
    }

    #[test]
    fn test_unknown_recipient_rejected() {
        let err = guard()
            .validate(
                Topology::Flat,
                &"coder".to_string(),
                &Recipient::agent("intern"),
            )
            .unwrap_err();
        assert_eq!(
            err,
            TopologyViolation::UnknownRecipient { id: "intern".into() }
        );
    }
}
