//! Client-side conversation state: reconciliation of streamed and persisted
//! messages, and the controller that owns it.

mod controller;
pub mod reconcile;
mod view;

pub use controller::{ChatController, PendingTurn, TurnPhase, TurnTag};
pub use reconcile::{Merge, MessageList};
pub use view::{ChatView, Notice};
