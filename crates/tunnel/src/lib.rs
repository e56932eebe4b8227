//! Meshtun Tunnel
//!
//! The dispatch engine: a set of addressable ports feeding one shared
//! inbound queue, drained by a single event loop that passes each message
//! through an ordered handler chain.
//!
//! ## Message flow
//!
//! ```text
//! transport → Port::send → inbound queue → handler chain (newest first)
//!                                              │
//!                                              └→ Port::deliver → PortReceiver → transport
//! ```
//!
//! ## Failure policy
//!
//! A handler error is fatal to the tunnel: the loop stops, every port is
//! closed, and the error is delivered once on the channel returned by
//! [`Tunnel::start`].

mod handler;
mod port;
mod switch;
mod tunnel;

pub use handler::{handler_fn, FnHandler, HandlerError, HandlerResult, MessageHandler};
pub use port::{Port, PortReceiver};
pub use switch::SwitchHandler;
pub use tunnel::{Tunnel, TunnelState};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Tunnel closed by request")]
    Closed,

    #[error("Handler failed: {0}")]
    Handler(#[source] HandlerError),

    #[error("Tunnel already started")]
    AlreadyStarted,

    #[error("Port closed: {0}")]
    PortClosed(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Dispatch loop panicked: {0}")]
    LoopPanicked(String),
}

impl TunnelError {
    /// Whether the loop ended because `close` was requested
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
