//! Tool manifest — the declarative description of a tool.
//!
//! Mirrors a tool's `tool.yaml`. The capsule manager only reads it: the
//! entrypoint path, optional interpreter, runtime args/env and the startup
//! timeout.

pub mod errors;
pub mod shebang;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use errors::ManifestError;
pub use shebang::parse_shebang;

// ─── Constants ───────────────────────────────────────────────────────────────

/// File name of a tool's manifest inside its directory.
pub const MANIFEST_FILE_NAME: &str = "tool.yaml";

/// Startup handshake timeout used when the manifest does not set one.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 5000;

// ─── Types ───────────────────────────────────────────────────────────────────

/// How the tool is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// Spawned fresh for every invocation.
    #[default]
    Simple,
    /// Long-lived process speaking JSON-RPC over stdio.
    Capsule,
}

/// Reload strategy for hot-load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotLoadMode {
    Restart,
}

/// Hot-reload configuration. Parsed and preserved; reload is driven by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotLoadConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watch: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<HotLoadMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
}

/// Runtime section of the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub mode: RuntimeMode,
    /// Maximum wait for the startup handshake, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hot_load: Option<HotLoadConfig>,
    /// Environment variables injected into the tool process.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Arguments appended after the entrypoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// MCP-facing schema metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

/// A tool's manifest (`tool.yaml`) plus the resolved entrypoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp: Option<McpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeConfig>,
    /// Absolute path to the entrypoint.
    #[serde(default)]
    pub path: PathBuf,
    /// Interpreter used to run the entrypoint, if it is not executed directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
}

impl ToolManifest {
    /// A minimal manifest for a tool whose entrypoint is already resolved.
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_interpreter(mut self, interpreter: &str) -> Self {
        self.interpreter = Some(interpreter.to_string());
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn mode(&self) -> RuntimeMode {
        self.runtime.as_ref().map(|r| r.mode).unwrap_or_default()
    }

    pub fn is_capsule(&self) -> bool {
        self.mode() == RuntimeMode::Capsule
    }

    /// Configured startup timeout, or the 5s default when unset or zero.
    pub fn startup_timeout(&self) -> Duration {
        let ms = self
            .runtime
            .as_ref()
            .and_then(|r| r.startup_timeout_ms)
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS);
        Duration::from_millis(ms)
    }

    pub fn runtime_args(&self) -> &[String] {
        self.runtime.as_ref().map(|r| r.args.as_slice()).unwrap_or_default()
    }

    pub fn runtime_env(&self) -> impl Iterator<Item = (&String, &String)> {
        self.runtime.iter().flat_map(|r| r.env.iter())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load and validate `tool_dir/tool.yaml`.
///
/// Resolves the entrypoint to an absolute path inside `tool_dir` and, when
/// the manifest names no interpreter, takes it from the entrypoint's shebang.
pub fn load_manifest(tool_dir: &Path) -> Result<ToolManifest, ManifestError> {
    let manifest_path = tool_dir.join(MANIFEST_FILE_NAME);
    let raw = std::fs::read_to_string(&manifest_path).map_err(|e| ManifestError::ReadFailed {
        path: manifest_path.clone(),
        reason: e.to_string(),
    })?;

    let mut manifest: ToolManifest =
        serde_yaml::from_str(&raw).map_err(|e| ManifestError::ParseFailed {
            path: manifest_path.clone(),
            reason: e.to_string(),
        })?;

    validate_required(&manifest)?;
    manifest.path = resolve_entrypoint(tool_dir, &manifest.entrypoint)?;

    if manifest.interpreter.as_deref().map_or(true, str::is_empty) {
        manifest.interpreter = match parse_shebang(&manifest.path) {
            Ok(interpreter) => Some(interpreter),
            Err(e) => {
                // Binaries have no shebang.
                tracing::debug!(
                    tool = %manifest.name,
                    path = %manifest.path.display(),
                    error = %e,
                    "no interpreter from shebang"
                );
                None
            }
        };
    }

    tracing::debug!(
        tool = %manifest.name,
        mode = ?manifest.mode(),
        path = %manifest.path.display(),
        "loaded tool manifest"
    );

    Ok(manifest)
}

fn validate_required(manifest: &ToolManifest) -> Result<(), ManifestError> {
    let required = [
        ("name", &manifest.name),
        ("version", &manifest.version),
        ("description", &manifest.description),
        ("entrypoint", &manifest.entrypoint),
    ];

    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(ManifestError::MissingField { field });
        }
    }
    Ok(())
}

/// Resolve `entrypoint` against `tool_dir`, rejecting paths that leave it.
fn resolve_entrypoint(tool_dir: &Path, entrypoint: &str) -> Result<PathBuf, ManifestError> {
    let invalid = |reason: String| ManifestError::InvalidEntrypoint {
        entrypoint: entrypoint.to_string(),
        reason,
    };

    let root = tool_dir
        .canonicalize()
        .map_err(|e| invalid(format!("tool directory unavailable: {e}")))?;
    let resolved = root
        .join(entrypoint)
        .canonicalize()
        .map_err(|e| invalid(e.to_string()))?;

    if !resolved.starts_with(&root) {
        return Err(invalid("entrypoint escapes the tool directory".into()));
    }
    if !resolved.is_file() {
        return Err(invalid("entrypoint is not a file".into()));
    }

    Ok(resolved)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
