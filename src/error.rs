//! Typed failures of the migration core.
//!
//! - Prerequisite failures are not errors: they travel as data in `StepCheck`/`PipelineReport`.
//! - Everything here is fatal for the step that raised it and aborts the pipeline.
//! - `Tool` belongs to the I/O category (external tool invocation fault).
//! - `SnapshotBadState` is the benign "already terminal" answer tolerated on release.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrateError>;

#[derive(Debug, Error)]
pub enum MigrateError {
    /// Invalid pump parameters or an unusable migration context.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Read/write/seek fault on a stream or the local filesystem.
    #[error("i/o failure during {operation}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// External tool exited unsuccessfully.
    #[error("{tool} failed with exit code {code}")]
    Tool {
        tool: String,
        code: i32,
        output: String,
    },

    /// Snapshot could not be created, queried or deleted.
    #[error("snapshot failure: {0}")]
    Snapshot(String),

    /// Snapshot mechanism reports the snapshot is already in a terminal state.
    #[error("snapshot already in a terminal state: {0}")]
    SnapshotBadState(String),

    /// Volume still too large for its destination after shrinking.
    #[error("volume of {actual} bytes exceeds destination capacity of {limit} bytes")]
    SizeConstraint { actual: u64, limit: u64 },

    /// Operation not available on this host or container.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl MigrateError {
    pub(crate) fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// True for read/write/tool faults.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Tool { .. })
    }
}

/// Attach an operation label to `io::Result`.
pub(crate) trait IoContext<T> {
    fn op(self, operation: &'static str) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn op(self, operation: &'static str) -> Result<T> {
        self.map_err(|e| MigrateError::io(operation, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn io_helper_keeps_source() {
        let err: Result<()> = Err(io::Error::other("disk gone")).op("read extent");
        let err = err.unwrap_err();
        assert!(err.is_io());
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "i/o failure during read extent");
    }

    #[test]
    fn tool_failures_count_as_io() {
        let err = MigrateError::Tool {
            tool: "diskpart.exe".into(),
            code: 5,
            output: String::new(),
        };
        assert!(err.is_io());
        assert!(!MigrateError::Snapshot("x".into()).is_io());
    }
}
