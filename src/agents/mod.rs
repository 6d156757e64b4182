pub mod episode;
pub mod scripted;

use async_trait::async_trait;

use crate::error::Result;
use crate::runtime::message::Message;

/// A mailbox-driven participant. `handle` consumes one delivered message and
/// returns zero or more new messages. Returned messages are not delivered
/// directly: the episode runner routes every one of them through the Router,
/// which keeps epoch stamping and topology validation sovereign.
#[async_trait]
pub trait Agent: Send {
    fn id(&self) -> &str;

    async fn handle(&mut self, msg: Message) -> Result<Vec<Message>>;
}

pub use episode::{EpisodeReport, EpisodeRunner};
pub use scripted::ScriptedAgent;
