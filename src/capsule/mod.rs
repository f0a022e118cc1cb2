//! Capsule host — long-lived tool processes spoken to over JSON-RPC stdio.
//!
//! This module handles:
//! - Spawning a tool's process from its manifest and supervising it
//! - Gating startup on the `orla.hello` handshake
//! - Correlating concurrent `tools/call` requests with their responses by id
//! - The CREATED / STARTING / READY / CRASHED / STOPPED lifecycle
//!
//! The dispatch layer owns one `CapsuleManager` per capsule-mode tool.

pub mod clock;
pub mod codec;
pub mod context;
pub mod demux;
pub mod errors;
pub mod logger;
pub mod manager;
pub mod process;
pub mod types;

// Re-exports for convenience
pub use clock::{Clock, FakeClock, SystemClock};
pub use context::CallContext;
pub use errors::{CapsuleError, ErrorCategory};
pub use logger::{CapsuleLogger, TracingLogger};
pub use manager::CapsuleManager;
pub use types::{CapsuleState, HelloParams, JsonRpcError, JsonRpcResponse, ToolCallResult};
