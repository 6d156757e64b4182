//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use apex::config::ApexConfig;
use apex::coordinator::Coordinator;
use apex::metrics::RuntimeMetrics;
use apex::runtime::{Message, MonotonicClock, Payload, Recipient, Router, SwitchEngine};

pub struct Rig {
    pub router: Arc<Router>,
    pub engine: Arc<SwitchEngine>,
    pub coordinator: Arc<Coordinator>,
    pub metrics: Arc<RuntimeMetrics>,
}

pub fn rig() -> Rig {
    rig_with(ApexConfig::default())
}

pub fn rig_with(config: ApexConfig) -> Rig {
    let metrics = Arc::new(RuntimeMetrics::new());
    let router = Arc::new(Router::new(
        &config.router,
        &config.topology,
        metrics.clone(),
        Arc::new(MonotonicClock),
    ));
    let engine = Arc::new(SwitchEngine::new(
        router.clone(),
        &config.switch,
        metrics.clone(),
    ));
    let coordinator = Arc::new(Coordinator::new(
        engine.clone(),
        &config.coordinator,
        metrics.clone(),
    ));
    Rig {
        router,
        engine,
        coordinator,
        metrics,
    }
}

pub fn msg(sender: &str, recipient: Recipient) -> Message {
    Message::new("ep-1", sender, recipient, Payload::empty())
}

pub fn msg_with_seq(sender: &str, recipient: Recipient, seq: u64) -> Message {
    let mut fields = serde_json::Map::new();
    fields.insert("seq".into(), serde_json::json!(seq));
    Message::new("ep-1", sender, recipient, Payload::new(fields).unwrap())
}

pub fn seq_of(msg: &Message) -> u64 {
    msg.payload
        .get("seq")
        .and_then(serde_json::Value::as_u64)
        .expect("message carries a seq field")
}
