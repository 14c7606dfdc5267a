//! Path Resolver and Existence Guard.
//!
//! `resolve` is pure string work and never touches the filesystem; `check`
//! then confirms the result is a real script inside the root.

use crate::error::GatewayError;
use crate::http::percent_decode;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// A request path resolved to a script file. Lives for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTarget {
    /// Normalized logical name, e.g. `tools/caption`.
    pub name: String,
    pub path: PathBuf,
}

pub struct Resolver {
    root: PathBuf,
    extension: String,
    allowed: Option<HashSet<String>>,
    require_executable: bool,
}

impl Resolver {
    /// `root` is canonicalized here, so it must exist.
    pub fn new(
        root: &Path,
        extension: &str,
        allowed: Option<&[String]>,
        require_executable: bool,
    ) -> io::Result<Self> {
        let root = fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a directory"));
        }
        Ok(Resolver {
            root,
            extension: extension.to_string(),
            allowed: allowed.map(|names| names.iter().cloned().collect()),
            require_executable,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, raw_path: &str) -> Result<ScriptTarget, GatewayError> {
        let path = raw_path
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        let decoded = percent_decode(path)
            .ok_or_else(|| GatewayError::BadRequest(format!("bad percent-encoding in {}", raw_path)))?;
        // The logical name is echoed in a response header.
        if decoded.chars().any(char::is_control) {
            return Err(GatewayError::BadRequest("control character in path".to_string()));
        }

        let mut segments = Vec::new();
        for segment in decoded.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(GatewayError::Forbidden(decoded.clone())),
                _ => segments.push(segment),
            }
        }
        if segments.is_empty() {
            return Err(GatewayError::NotFound(decoded));
        }

        let name = segments.join("/");
        let mut path = self.root.clone();
        for segment in &segments {
            path.push(segment);
        }
        let mut file_name = path.file_name().unwrap_or_default().to_os_string();
        file_name.push(&self.extension);
        path.set_file_name(file_name);

        Ok(ScriptTarget { name, path })
    }

    /// Existence Guard: the target must be a dispatchable regular file.
    /// Returns the target with its canonical path.
    pub fn check(&self, target: ScriptTarget) -> Result<ScriptTarget, GatewayError> {
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(&target.name) {
                return Err(GatewayError::NotFound(target.name));
            }
        }

        let canonical = match fs::canonicalize(&target.path) {
            Ok(path) => path,
            Err(_) => return Err(GatewayError::NotFound(target.name)),
        };
        if !canonical.starts_with(&self.root) {
            return Err(GatewayError::Forbidden(target.name));
        }

        let metadata = match fs::metadata(&canonical) {
            Ok(metadata) => metadata,
            Err(_) => return Err(GatewayError::NotFound(target.name)),
        };
        if !metadata.is_file() {
            return Err(GatewayError::NotFound(target.name));
        }
        if self.require_executable && metadata.permissions().mode() & 0o111 == 0 {
            return Err(GatewayError::NotFound(target.name));
        }

        Ok(ScriptTarget {
            name: target.name,
            path: canonical,
        })
    }
}
