use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::panel::PanelError;
use crate::payments::PaymentError;

/// Error taxonomy surfaced by every orchestrator operation. Transport
/// details from panels and the payment provider stay in the logs; the
/// response body carries only the class and a generic message.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid subscription period: {0} days")]
    InvalidPeriod(i64),
    #[error("{0}")]
    Validation(String),
    #[error("identity verification failed")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("payment not confirmed yet")]
    PaymentNotConfirmed,
    #[error("{0}")]
    Conflict(String),
    #[error("no provisioning backend available")]
    NoPanelAvailable,
    #[error("upstream unavailable: {0}")]
    Upstream(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    fn status(&self) -> StatusCode {
        match self {
            ServiceError::InvalidPeriod(_) | ServiceError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::PaymentNotConfirmed => StatusCode::PAYMENT_REQUIRED,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::NoPanelAvailable | ServiceError::Upstream(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidPeriod(_) | ServiceError::Validation(_) => "validation_error",
            ServiceError::Unauthorized => "unauthorized",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::PaymentNotConfirmed => "payment_not_confirmed",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::NoPanelAvailable | ServiceError::Upstream(_) => "upstream_unavailable",
            ServiceError::Internal(_) => "internal",
        }
    }

    fn public_message(&self) -> String {
        match self {
            ServiceError::Upstream(_) => "upstream service unavailable".to_string(),
            ServiceError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match &self {
            ServiceError::Internal(e) => tracing::error!(error = ?e, "Internal error"),
            ServiceError::Upstream(msg) => tracing::warn!(detail = %msg, "Upstream unavailable"),
            _ => {}
        }
        let body = json!({
            "error": self.public_message(),
            "code": self.code(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<PanelError> for ServiceError {
    fn from(e: PanelError) -> Self {
        match e {
            PanelError::ClientNotFound => ServiceError::NotFound("subscription"),
            other => ServiceError::Upstream(other.to_string()),
        }
    }
}

impl From<PaymentError> for ServiceError {
    fn from(e: PaymentError) -> Self {
        ServiceError::Upstream(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ServiceError::InvalidPeriod(45).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServiceError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ServiceError::NotFound("label").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ServiceError::PaymentNotConfirmed.status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ServiceError::Conflict("trial already used".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::NoPanelAvailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn upstream_detail_stays_private() {
        let err = ServiceError::Upstream("connect error: 10.0.0.3:2053 refused".into());
        assert_eq!(err.public_message(), "upstream service unavailable");
        assert_eq!(err.code(), "upstream_unavailable");
    }

    #[test]
    fn panel_not_found_translates_to_404() {
        let err: ServiceError = PanelError::ClientNotFound.into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
