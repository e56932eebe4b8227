use async_trait::async_trait;
use meshtun_core::Message;

use crate::Tunnel;

/// Error a handler reports to abort the tunnel
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// `Ok(true)` claims the message and stops the chain, `Ok(false)` passes it on
pub type HandlerResult = std::result::Result<bool, HandlerError>;

/// One stage of the dispatch chain.
///
/// Handlers run on the dispatch loop one message at a time. Later
/// registrations run first. A handler that never returns stalls the tunnel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Name used in log lines
    fn name(&self) -> &str {
        "handler"
    }

    async fn handle(&self, tunnel: &Tunnel, msg: &Message) -> HandlerResult;
}

/// Adapter for synchronous closures, see [`handler_fn`]
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wrap a closure as a [`MessageHandler`]
pub fn handler_fn<F>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(&Tunnel, &Message) -> HandlerResult + Send + Sync,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Tunnel, &Message) -> HandlerResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, tunnel: &Tunnel, msg: &Message) -> HandlerResult {
        (self.f)(tunnel, msg)
    }
}
