//! JSON envelope and error mapping shared by every API route.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::FromRequest;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::downloads::DownloadError;
use crate::scheduler::SchedulerError;
use crate::streaming::{unsatisfied_range, RangeError, StreamError};

/// `{success, message, data?, error?}`, plus `pagination` on listings.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub total_pages: i64,
}

impl Pagination {
    #[must_use]
    pub fn new(page: i64, limit: i64, total: i64) -> Self {
        let limit = limit.max(1);
        Self {
            page,
            limit,
            total,
            total_pages: (total + limit - 1) / limit,
        }
    }
}

/// 200 with data.
pub fn ok<T: Serialize>(message: impl Into<String>, data: T) -> Response {
    envelope(StatusCode::OK, message, Some(data), None)
}

/// 201 with data.
pub fn created<T: Serialize>(message: impl Into<String>, data: T) -> Response {
    envelope(StatusCode::CREATED, message, Some(data), None)
}

/// 202: the work was queued and will be reported through activities and the hub.
pub fn accepted<T: Serialize>(message: impl Into<String>, data: T) -> Response {
    envelope(StatusCode::ACCEPTED, message, Some(data), None)
}

pub fn paginated<T: Serialize>(message: impl Into<String>, data: T, pagination: Pagination) -> Response {
    envelope(StatusCode::OK, message, Some(data), Some(pagination))
}

fn envelope<T: Serialize>(
    status: StatusCode,
    message: impl Into<String>,
    data: Option<T>,
    pagination: Option<Pagination>,
) -> Response {
    (
        status,
        Json(ApiResponse {
            success: true,
            message: message.into(),
            data,
            error: None,
            pagination,
        }),
    )
        .into_response()
}

/// Error kinds surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    ForbiddenPath,
    RangeNotSatisfiable,
    ServiceUnavailable,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::ForbiddenPath => "forbidden_path",
            Self::RangeNotSatisfiable => "range_not_satisfiable",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Internal => "internal",
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidArgument => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::ForbiddenPath => StatusCode::FORBIDDEN,
            Self::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    /// File size for the `Content-Range: bytes */size` header of a 416.
    range_size: Option<u64>,
}

pub type ApiResult<T = Response> = Result<T, ApiError>;

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            range_size: None,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn forbidden_path() -> Self {
        Self::new(ErrorKind::ForbiddenPath, "Path traversal is not allowed")
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            message: self.message,
            data: None,
            error: Some(self.kind.as_str()),
            pagination: None,
        };
        let mut response = (self.kind.status(), Json(body)).into_response();
        if let Some(size) = self.range_size {
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, unsatisfied_range(size));
        }
        response
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<DownloadError>() {
            return match e {
                DownloadError::Unavailable(_) => Self::service_unavailable(e.to_string()),
                DownloadError::NothingToDispatch => Self::invalid_argument(e.to_string()),
                DownloadError::Rejected { .. } => Self::new(ErrorKind::Internal, e.to_string()),
            };
        }
        tracing::error!("Request failed: {err:#}");
        Self::internal("Internal server error")
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::InvalidArgument(message) => Self::invalid_argument(message),
            SchedulerError::NotFound(_) => Self::not_found(err.to_string()),
            SchedulerError::Store(e) => e.into(),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        anyhow::Error::new(err).into()
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Forbidden => Self::forbidden_path(),
            StreamError::NotFound => Self::not_found("File not found"),
            StreamError::NotAFile => Self::invalid_argument("Path is not a regular file"),
            StreamError::Range(RangeError::Unsatisfiable { size }) => Self {
                kind: ErrorKind::RangeNotSatisfiable,
                message: "Requested range not satisfiable".to_string(),
                range_size: Some(size),
            },
            StreamError::Range(RangeError::Malformed) => Self::new(
                ErrorKind::RangeNotSatisfiable,
                "Malformed Range header",
            ),
            StreamError::Io(e) => {
                tracing::error!("Stream failed: {e}");
                Self::internal("Failed to read file")
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid_argument(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::invalid_argument(rejection.body_text())
    }
}

/// `Json` whose rejections render as the API envelope.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// `Query` whose rejections render as the API envelope.
#[derive(Debug, axum::extract::FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);
