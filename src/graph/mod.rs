//! Conversation controller: a closed state machine over one chat turn.
//!
//! Classify -> Retrieve -> Grade -> (Generate | Rewrite -> Classify) -> Done,
//! with Clarify as an alternative exit from Classify.

mod controller;
mod error;
mod locks;
pub mod prompts;
mod state;

pub use controller::{Answer, ChatTurnRequest, ConversationController};
pub use error::ControllerError;
pub use locks::ThreadLocks;
pub use state::{transition, Outcome, Step};
