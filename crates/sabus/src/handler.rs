//! Subscriber callback contract.

use crate::envelope::Envelope;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Receives decoded envelopes for one subscription.
///
/// Errors (and panics) are caught by the dispatcher and logged. They never
/// reach other handlers or the connection.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`EnvelopeHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EnvelopeHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        (self.f)(envelope).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```rust,ignore
/// let handler = handler_fn(|env: Envelope| async move {
///     println!("{} from {}", env.event_type, env.source);
///     anyhow::Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EnvelopeHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
