// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Typed error hierarchy for the inference stage.
//!
//! Shape and format validation errors are never downgraded: stages wrap them
//! in [`Error::Element`] so the host can attribute the failure, and
//! [`Error::root`] recovers the original kind.

use std::sync::Arc;

/// All errors originating from the inference stage, its mappers and the
/// output decoder.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A native context handle is missing or failed its integrity check.
    #[error("invalid native handle: {0}")]
    InvalidHandle(String),

    /// The model path is unreadable or the model format is invalid.
    #[error("model load error: {0}")]
    ModelLoad(String),

    /// Negotiated or observed media kind / memory domain is outside the
    /// supported set.
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    /// Tensor dimensions are outside the supported set.
    #[error("unsupported shape: {0}")]
    UnsupportedShape(String),

    /// A configuration parameter is missing or out of range.
    #[error("invalid parameter: {0}")]
    Param(String),

    /// A raw buffer or required blob is absent.
    #[error("null data: {0}")]
    NullData(String),

    /// Raised by an inference engine while executing a request.
    #[error("inference error: {0}")]
    Inference(String),

    /// The request backing an output frame failed. Shared by every consumer
    /// that waits on the same frame.
    #[error("inference request failed: {0}")]
    RequestFailed(#[source] Arc<Error>),

    /// Initialization failed before; the stage stays unusable.
    #[error("stage initialization failed: {0}")]
    InitFailed(#[source] Arc<Error>),

    /// A buffer could not be mapped into the requested view.
    #[error("memory mapping failed: {0}")]
    Map(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error attributed to a named pipeline element.
    #[error("{element}: {source}")]
    Element {
        element: String,
        source: Box<Error>,
    },
}

impl Error {
    /// Returns the innermost error, looking through element attribution and
    /// shared request failures.
    pub fn root(&self) -> &Error {
        match self {
            Self::Element { source, .. } => source.root(),
            Self::RequestFailed(inner) | Self::InitFailed(inner) => inner.root(),
            other => other,
        }
    }

    /// Stable integer error code for structured logging.
    ///
    /// - 1xx: native handles and memory
    /// - 2xx: model and inference
    /// - 3xx: shape and input contracts
    /// - 4xx: I/O and serialization
    pub fn error_code(&self) -> u32 {
        match self.root() {
            Self::InvalidHandle(_) => 100,
            Self::Map(_) => 101,
            Self::ModelLoad(_) => 200,
            Self::Inference(_) => 201,
            Self::UnsupportedInput(_) => 300,
            Self::UnsupportedShape(_) => 301,
            Self::NullData(_) => 302,
            Self::Param(_) => 303,
            Self::Io(_) => 400,
            Self::Json(_) => 401,
            // root() never returns a wrapper
            Self::RequestFailed(_) | Self::InitFailed(_) | Self::Element { .. } => 0,
        }
    }

    /// Whether the stage can keep processing after this error. Only the
    /// affected frame is lost.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root(),
            Self::NullData(_) | Self::Inference(_) | Self::Map(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Attributes errors to a named element.
pub trait ElementContext<T> {
    fn element(self, element: &str) -> Result<T>;
}

impl<T> ElementContext<T> for Result<T> {
    fn element(self, element: &str) -> Result<T> {
        self.map_err(|source| Error::Element {
            element: element.to_owned(),
            source: Box::new(source),
        })
    }
}
