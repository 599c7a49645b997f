//! HTTP mapping for [`MothershipError`].
//!
//! | Error | Status |
//! |---|---|
//! | `NotFound` | 404 |
//! | `DuplicateName`, `InvalidTransition`, `ReferencedByDependent` | 409 |
//! | `UnknownReference`, `DirectiveExpired`, `NoApplicableKnowledge` | 422 |
//! | `Validation` | 400 |
//! | `Unauthorized` | 403 |
//! | `NoEligibleAgent` | 503 |
//! | `Storage`, `Provider` | 500 |
//!
//! Body: `{"error": <kind>, "detail": <message>}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mothership_types::MothershipError;
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug)]
pub struct ApiError(pub MothershipError);

impl From<MothershipError> for ApiError {
    fn from(e: MothershipError) -> Self {
        Self(e)
    }
}

impl From<mothership_memory::ontology::KnowledgeError> for ApiError {
    fn from(e: mothership_memory::ontology::KnowledgeError) -> Self {
        Self(e.into())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
}

pub fn status_for(e: &MothershipError) -> StatusCode {
    match e {
        MothershipError::NotFound { .. } => StatusCode::NOT_FOUND,
        MothershipError::DuplicateName { .. }
        | MothershipError::InvalidTransition { .. }
        | MothershipError::ReferencedByDependent { .. } => StatusCode::CONFLICT,
        MothershipError::UnknownReference { .. }
        | MothershipError::DirectiveExpired(_)
        | MothershipError::NoApplicableKnowledge { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        MothershipError::Validation(_) => StatusCode::BAD_REQUEST,
        MothershipError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        MothershipError::NoEligibleAgent { .. } => StatusCode::SERVICE_UNAVAILABLE,
        MothershipError::Storage(_) | MothershipError::Provider(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %self.0, "request failed");
        } else {
            warn!(error = %self.0, status = status.as_u16(), "request rejected");
        }
        let body = ErrorBody {
            error: self.0.kind(),
            detail: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
