use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rollcall_core::{AnalyzerError, EmbeddingError, GateError};
use serde::Serialize;
use thiserror::Error;

use crate::engine::EngineError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("multiple faces detected in the image, exactly one is required")]
    MultipleFacesDetected,
    #[error("face not recognized")]
    NoMatchFound,
    #[error("this face is already registered")]
    FaceAlreadyRegistered,
    #[error("a user with this email already exists")]
    EmailAlreadyExists,
    #[error("attendance already marked for today")]
    AlreadyMarkedToday,
    #[error("embedding: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("analyzer: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("face engine unavailable")]
    EngineUnavailable,
}

impl From<GateError> for ServiceError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::NoFaceDetected => ServiceError::NoFaceDetected,
            GateError::MultipleFacesDetected(_) => ServiceError::MultipleFacesDetected,
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Analyzer(e) => ServiceError::Analyzer(e),
            EngineError::Io(e) => ServiceError::Io(e),
            EngineError::ChannelClosed => ServiceError::EngineUnavailable,
        }
    }
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_)
            | ServiceError::NoFaceDetected
            | ServiceError::MultipleFacesDetected
            | ServiceError::NoMatchFound
            | ServiceError::FaceAlreadyRegistered
            | ServiceError::EmailAlreadyExists
            | ServiceError::AlreadyMarkedToday => StatusCode::BAD_REQUEST,
            ServiceError::Embedding(_)
            | ServiceError::Analyzer(_)
            | ServiceError::Store(_)
            | ServiceError::Io(_)
            | ServiceError::EngineUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub message: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "internal error");
            "internal server error".to_owned()
        } else {
            tracing::debug!(error = %self, "request rejected");
            self.to_string()
        };
        (status, Json(ErrorBody { message })).into_response()
    }
}
