//! Bidirectional agent protocol (JSON-RPC 2.0 over NDJSON on stdio)
//!
//! Used by agents that hold a long-lived conversation with the host rather
//! than streaming one-shot output. The [`AcpClient`] owns the framing and
//! the two pending-reply maps (one per direction); [`AcpSession`] tracks the
//! per-conversation state machine; `protocol` holds the wire types.

pub mod client;
pub mod protocol;
pub mod session;

pub use client::{AcpClient, AcpDelegate, AcpError};
pub use protocol::{
    methods, PermissionOption, PermissionOptionKind, PromptResult, RequestPermissionOutcome,
    RequestPermissionParams, RequestPermissionResult, RpcError, SessionNotification,
    SessionUpdate, StopReason, PROTOCOL_VERSION,
};
pub use session::{AcpSession, SessionState, SessionStateError};
