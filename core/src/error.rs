//! Error types for the SLU core.
//!
//! Configuration and model-version errors fail the whole operation.
//! Per-DAI errors (insufficient data, fit, prediction) are local: the
//! training or decoding loop logs them and moves on to the next classifier.

use thiserror::Error;

/// Errors produced by the SLU core.
#[derive(Debug, Error)]
pub enum SluError {
    /// No usable input was supplied, or preprocessing was requested without
    /// an utterance source.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The feature assembler produced zero feature sets.
    #[error("cannot construct features: {0}")]
    FeatureConstruction(String),

    /// A single DAI had too few positive or negative training rows.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// The underlying learner failed for a single DAI.
    #[error("fit failed: {0}")]
    Fit(String),

    /// Prediction failed for a single DAI during decoding.
    #[error("prediction failed: {0}")]
    Prediction(String),

    /// The model artefact carries an unknown version tag.
    #[error("unknown version of the SLU model file: {0}")]
    ModelVersion(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(String),
}

pub type SluResult<T> = Result<T, SluError>;
