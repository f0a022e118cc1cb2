//! Capsule host: runs tools as long-lived subprocesses and talks to them
//! with JSON-RPC 2.0 over stdio.

pub mod capsule;
pub mod manifest;

pub use capsule::{CallContext, CapsuleError, CapsuleManager, CapsuleState, ToolCallResult};
pub use manifest::{load_manifest, ManifestError, ToolManifest};
