//! Provides error definitions.
use std::borrow::Cow;

use thiserror::Error;

/// Enumerates possible error types that can occur within capstan operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Error when no stacked inputs (or zero scan steps) are provided.
    #[error("scan must have at least one input step")]
    ScanMissingArg,

    /// Error when the leading dimensions of all scan inputs do not match.
    #[error("all scan arguments must have the same first dim")]
    ScanShapeMismatch,

    /// Error when a stacked input has no leading dimension to scan over.
    #[error("scan arguments must have at least one dimension")]
    ScanArgRankZero,

    /// Error when the combine function mutates its carry or x argument.
    #[error("in-place operation on a scan input is not allowed: {0}")]
    InPlaceOnScanInput(Cow<'static, str>),

    /// Error when an expression built under one trace is used under another.
    #[error("placeholder does not belong to the active trace: {0}")]
    StalePlaceholder(Cow<'static, str>),

    /// Error when the carry returned by the combine function differs from
    /// the carry it was given.
    #[error("carry structure changed across a scan step")]
    CarryStructureMismatch,

    /// Error when two trees that must share a structure do not.
    #[error("tree structure mismatch")]
    TreeStructureMismatch,

    /// Error when unflattening with the wrong number of leaves.
    #[error("expected {expected} leaves, got {got}")]
    LeafCountMismatch { expected: usize, got: usize },

    /// Error when an expression has no well-formed type.
    #[error("type inference failed for {0}")]
    UntypedExpression(Cow<'static, str>),

    /// Error when a program is invoked with the wrong arguments.
    #[error("program argument mismatch: {0}")]
    ProgramArgMismatch(Cow<'static, str>),

    #[error("unsupported {0}")]
    Unsupported(Cow<'static, str>),

    /// Internal error for implementation-specific failures
    #[error("internal error: {0}")]
    Internal(Cow<'static, str>),
}

pub(crate) fn internal(msg: &'static str) -> Error {
    Error::Internal(Cow::Borrowed(msg))
}
