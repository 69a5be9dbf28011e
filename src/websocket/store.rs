use async_trait::async_trait;
use crate::Result;
use super::chat::PairKey;

/// Sink for relayed chat messages.
///
/// History and unread notifications live in the backend data store; the
/// relay only hands each delivered message over. A failing store never
/// blocks or undoes delivery.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn record(&self, pair: &PairKey, sender: &str, receiver: &str, message: &str) -> Result<()>;
}

/// Store used when no backend is attached. Drops every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl MessageStore for NoopStore {
    async fn record(&self, _pair: &PairKey, _sender: &str, _receiver: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}
