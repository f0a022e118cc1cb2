//! Interpreter detection from an entrypoint's shebang line.

use std::io::{BufRead, BufReader};
use std::path::Path;

use super::errors::ManifestError;

/// Parse the interpreter named on the first line of `path`.
///
/// `#!/usr/bin/env python3` yields `/usr/bin/env`: only the first field is
/// the interpreter, any arguments after it are ignored.
pub fn parse_shebang(path: &Path) -> Result<String, ManifestError> {
    let file = std::fs::File::open(path).map_err(|_| ManifestError::ShebangUnreadable {
        path: path.to_path_buf(),
    })?;

    let mut first = Vec::new();
    BufReader::new(file)
        .read_until(b'\n', &mut first)
        .map_err(|_| ManifestError::ShebangUnreadable {
            path: path.to_path_buf(),
        })?;

    let line = String::from_utf8_lossy(&first).trim().to_string();
    let Some(rest) = line.strip_prefix("#!") else {
        return Err(ManifestError::ShebangInvalidPrefix {
            path: path.to_path_buf(),
            line,
        });
    };

    match rest.split_whitespace().next() {
        Some(interpreter) => Ok(interpreter.to_string()),
        None => Err(ManifestError::ShebangEmpty {
            path: path.to_path_buf(),
            line,
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
