//! Mapping of core errors to HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::error::{BrokerError, Error, LostMessage};
use crate::types::FailedChunk;

/// Error returned by every handler.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(value: Error) -> Self {
        ApiError(value)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    lost: Vec<LostMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failed_chunks: Vec<FailedChunk>,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound { .. } | Error::UnknownConnection(_) => StatusCode::NOT_FOUND,
            Error::InvalidEndpoint(_) | Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::AmbiguousId { .. } => StatusCode::CONFLICT,
            Error::Broker(broker) => match broker {
                BrokerError::QueueNotFound(_) => StatusCode::NOT_FOUND,
                BrokerError::ConnectionTimeout(_) | BrokerError::ReceiptTimeout { .. } => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                BrokerError::ConnectionRejected(_)
                | BrokerError::Unreachable(_)
                | BrokerError::PublishRejected { .. } => StatusCode::BAD_GATEWAY,
                BrokerError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
                BrokerError::Protocol(_) | BrokerError::Transport(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Error::PartialFailure { .. } | Error::DataLossRisk { .. } | Error::Interrupted(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            Error::Broker(BrokerError::ConnectionTimeout(_)) => "connection_timeout",
            Error::Broker(BrokerError::ConnectionRejected(_)) => "connection_rejected",
            Error::Broker(BrokerError::ReceiptTimeout { .. }) => "receipt_timeout",
            Error::Broker(BrokerError::QueueNotFound(_)) => "queue_not_found",
            Error::Broker(_) => "broker",
            Error::NotFound { .. } => "not_found",
            Error::AmbiguousId { .. } => "ambiguous_id",
            Error::PartialFailure { .. } => "partial_failure",
            Error::DataLossRisk { .. } => "data_loss_risk",
            Error::UnknownConnection(_) => "unknown_connection",
            Error::InvalidEndpoint(_) => "invalid_endpoint",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Interrupted(_) => "interrupted",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let error = self.0.to_string();

        if status.is_server_error() {
            error!(kind, error = %error, "Request failed");
        }

        let (lost, failed_chunks) = match self.0 {
            Error::DataLossRisk { lost, .. } => (lost, Vec::new()),
            Error::PartialFailure { chunks, .. } => (Vec::new(), chunks),
            _ => (Vec::new(), Vec::new()),
        };

        let body = ErrorBody {
            error,
            kind,
            lost,
            failed_chunks,
        };
        (status, Json(body)).into_response()
    }
}
