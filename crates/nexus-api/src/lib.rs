//! nexus-api: wire layer for the DataNexus analytics agent
//!
//! This crate owns everything that touches the network: request payloads,
//! the `data:` frame splitter, the tagged event decoder, the streaming HTTP
//! transport, and the REST client for the session service.

pub mod error;
pub mod event;
pub mod frame;
pub mod request;
pub mod service;
pub mod transport;

pub use error::{Error, Result};
pub use event::{StreamEvent, ToolCallStatus, ToolResultStatus};
pub use frame::{Frame, FrameDecoder};
pub use request::*;
pub use service::{HttpSessionService, SessionService, SessionSummary, StoredMessage, StoredStep};
pub use transport::{
    Endpoint, HttpTransport, RetryConfig, Transport, TransportEvent, TransportStream,
    validate_server_url,
};
