use thiserror::Error;

/// Main error type for the NAO search system
#[derive(Error, Debug)]
pub enum NaoError {
    #[error("Architecture error: {0}")]
    Arch(#[from] ArchError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Architecture descriptor errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArchError {
    #[error("Unknown layer kind {kind} in {side} layer {layer}")]
    UnknownLayerKind {
        side: String,
        layer: usize,
        kind: usize,
    },

    #[error("Bad layer code length in {side} layer {layer}: expected {expected}, got {actual}")]
    BadLayerLength {
        side: String,
        layer: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Index {index} out of range for {field} ({size} candidates) in {side} layer {layer}")]
    IndexOutOfRange {
        side: String,
        layer: usize,
        field: String,
        index: usize,
        size: usize,
    },

    #[error("Layer count mismatch: expected {expected_enc} encoder / {expected_dec} decoder layers, got {actual_enc} / {actual_dec}")]
    LayerCountMismatch {
        expected_enc: usize,
        expected_dec: usize,
        actual_enc: usize,
        actual_dec: usize,
    },

    #[error("Bad arch sequence: {message}")]
    BadSequence { message: String },

    #[error("Net code parse error: {message}")]
    Parse { message: String },
}

/// Data-related errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Data file not found: {path}")]
    FileNotFound { path: String },

    #[error("Split not loaded: {split}")]
    SplitNotLoaded { split: String },

    #[error("Source and target sizes differ in split {split}: {source_len} vs {target_len}")]
    MisalignedSplit {
        split: String,
        source_len: usize,
        target_len: usize,
    },

    #[error("Reference sentences unavailable: {message}")]
    MissingReferences { message: String },

    #[error("Data parsing error: {message}")]
    ParseError { message: String },

    #[error("Empty split: {split}")]
    EmptySplit { split: String },
}

/// Search loop errors
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Cannot sample from an empty architecture pool")]
    EmptyPool,

    #[error("Performance vector length {actual} does not match pool size {expected}")]
    PerformanceLength { expected: usize, actual: usize },

    #[error("Invalid sampling probabilities: {message}")]
    InvalidProbabilities { message: String },

    #[error("Search space exhausted at lambda {lambda}: generated {generated} of {needed} new architectures")]
    SearchSpaceExhausted {
        lambda: usize,
        generated: usize,
        needed: usize,
    },

    #[error("Controller training failed: {message}")]
    ControllerTraining { message: String },

    #[error("Persistence failed: {message}")]
    Persistence { message: String },
}

/// Result type alias for NAO operations
pub type NaoResult<T> = Result<T, NaoError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::NaoError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::NaoError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::NaoError::Config(format!($($arg)*))
    };
}
