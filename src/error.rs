//! Error taxonomy for planning and executing backward-filter operators.
//!
//! Negative capability answers are not errors: `is_available` returns `false`
//! and the caller moves on to another algorithm. Everything below is surfaced
//! synchronously from `exec` or the planning queries and is never retried.

use thiserror::Error;

/// Failures raised while slicing, planning or executing a convolution.
#[derive(Debug, Error)]
pub enum ConvError {
    /// The configuration cannot be served by the requested algorithm.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Layouts disagree with each other or with the filter metadata.
    ///
    /// This is a caller bug (for example a group count that does not divide
    /// the channel extent), not a data condition.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    /// The dense sub-operator failed while running group `group`.
    ///
    /// Groups after `group` were not attempted.
    #[error("sub-operator failed on group {group}: {source}")]
    SubOperatorFailure {
        /// Index of the group whose execution failed.
        group: usize,
        /// The sub-operator's own error.
        #[source]
        source: Box<ConvError>,
    },

    /// Allocation of a workspace or operator instance failed.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// The caller handed in less scratch memory than the algorithm declared.
    #[error("workspace too small: {required} bytes required, {provided} provided")]
    WorkspaceTooSmall {
        /// Bytes declared by `get_workspace_in_bytes`.
        required: usize,
        /// Bytes actually provided.
        provided: usize,
    },

    /// A serialized parameter block could not be decoded.
    #[error("invalid parameter block: {0}")]
    InvalidParam(String),
}

/// Shorthand used across the crate.
pub type Result<T> = core::result::Result<T, ConvError>;

impl ConvError {
    pub(crate) fn layout(msg: impl Into<String>) -> Self {
        Self::InvalidLayout(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration(msg.into())
    }
}
