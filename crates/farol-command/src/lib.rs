//! Farol Command - per-target command channel
//!
//! A controlling process appends typed command envelopes to a target's
//! queue in the coordination store; the target drains the queue while
//! running and acknowledges each envelope once it is finally handled.
//! Delivery is at-least-once to a live target, never to a target that
//! never becomes live; ordering is FIFO per (sender, target).

pub mod handler;
pub mod receiver;
pub mod sender;

pub use handler::{CommandHandler, CommandHandlerRegistry, FnCommandHandler};
pub use receiver::{CommandReceiver, CommandReceiverHandle, ReceiverConfig};
pub use sender::CommandSender;
