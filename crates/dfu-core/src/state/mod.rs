//! State module - section dispatcher and its handlers.

pub mod handlers;
pub mod machine;

pub use handlers::{HandleResult, HandlerContext, dispatch};
pub use machine::{ParserState, SessionState};
