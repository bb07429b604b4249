//! Handler contract exposed to user code.
//!
//! A handler receives one message and a cancellation token. Returning `Ok`
//! acknowledges the message; returning an error (or panicking) releases it
//! for redelivery. The token fires when the host shuts down, so long-running
//! handlers can stop early.

use crate::message::Message;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;

/// User business logic invoked for every delivered message
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message
    async fn handle(&self, message: &Message, cancellation: CancellationToken)
        -> anyhow::Result<()>;
}

/// [`MessageHandler`] built from an async closure taking an owned message.
///
/// ```
/// use queue_host_core::handler::FnHandler;
///
/// let handler = FnHandler::new(|message, _cancellation| async move {
///     println!("{}", message.message_id);
///     Ok::<_, anyhow::Error>(())
/// });
/// # let _ = handler;
/// ```
pub struct FnHandler<F, Fut> {
    handler: F,
    _future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Message, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _future: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(Message, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(
        &self,
        message: &Message,
        cancellation: CancellationToken,
    ) -> anyhow::Result<()> {
        (self.handler)(message.clone(), cancellation).await
    }
}

impl<F, Fut> std::fmt::Debug for FnHandler<F, Fut> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}
