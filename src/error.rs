//! Typed errors that callers need to tell apart.
//!
//! Everything else in the crate travels as `anyhow::Error`.

use std::path::PathBuf;

/// The packet-filter tool refused an operation.
///
/// "Rule or chain already gone" is never reported through this type:
/// backends turn it into success before returning.
#[derive(Clone, Debug)]
pub struct BackendError {
    pub context: String,
    pub diagnostic: String,
}

impl BackendError {
    pub fn new(context: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            diagnostic: diagnostic.into(),
        }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "firewall error while {}: {}", self.context, self.diagnostic.trim())
    }
}
impl std::error::Error for BackendError {}

/// One drop-file entry (or the whole file, when `index` is `None`) could not be used.
#[derive(Clone, Debug)]
pub struct MalformedRecord {
    pub index: Option<usize>,
    pub reason: String,
}

impl std::fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(index) => write!(f, "malformed record #{}: {}", index, self.reason),
            None => write!(f, "malformed drop file: {}", self.reason),
        }
    }
}
impl std::error::Error for MalformedRecord {}

/// A directory watch could not be established.
#[derive(Clone, Debug)]
pub struct WatchSetupError {
    pub path: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for WatchSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot watch {}: {}", self.path.display(), self.reason)
    }
}
impl std::error::Error for WatchSetupError {}
