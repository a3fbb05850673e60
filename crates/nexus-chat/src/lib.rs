//! nexus-chat: conversation core for the DataNexus analytics agent
//!
//! Folds decoded stream events into message state, pauses and resumes turns
//! around query approval, resolves inline placeholder tokens for rendering,
//! and keeps the session list in step with the session service.

pub mod chat;
pub mod error;
pub mod events;
pub mod gate;
pub mod hydrate;
pub mod message;
pub mod placeholder;
pub mod reducer;
pub mod store;
pub mod util;
pub mod viz;

pub use chat::{Chat, ChatConfig, ChatSnapshot, TurnHandle};
pub use error::{Error, Result};
pub use events::ChatEvent;
pub use message::{DisplayType, Message, MessageStatus, Role, Session, VisualizationResult};
pub use placeholder::{Segment, resolve};
pub use reducer::{TurnReducer, mark_interrupted};
pub use store::{DRAFT_SESSION_ID, SessionInfo, SessionStore};
