use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Path, Request},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("username already exists")]
    DuplicateUser,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("authentication required")]
    Unauthorized,
    #[error("access denied")]
    Forbidden,
    #[error("session not found")]
    SessionNotFound,
    #[error("user not found")]
    UserNotFound,
    #[error("request validation failed")]
    Validation(Vec<FieldError>),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::DuplicateUser => StatusCode::CONFLICT,
            AuthError::InvalidCredentials | AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::SessionNotFound | AuthError::UserNotFound => StatusCode::NOT_FOUND,
            AuthError::Validation(_) => StatusCode::BAD_REQUEST,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AuthError::DuplicateUser => "duplicate_user",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::Unauthorized => "unauthorized",
            AuthError::Forbidden => "forbidden",
            AuthError::SessionNotFound => "session_not_found",
            AuthError::UserNotFound => "user_not_found",
            AuthError::Validation(_) => "validation_error",
            AuthError::Internal(_) => "server_error",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

impl<'a> ErrorBody<'a> {
    pub fn simple(error: &'a str) -> Self {
        Self {
            error,
            details: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

impl FieldError {
    pub const fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        match self {
            AuthError::Internal(err) => {
                tracing::error!(?err, "request failed with an internal error");
                (status, Json(ErrorBody::simple(code))).into_response()
            }
            AuthError::Validation(details) => (
                status,
                Json(ErrorBody {
                    error: code,
                    details: Some(details),
                }),
            )
                .into_response(),
            _ => (status, Json(ErrorBody::simple(code))).into_response(),
        }
    }
}

/// JSON body extractor whose rejections use the validation error shape.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AuthError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                tracing::debug!(reason = %rejection.body_text(), "rejected request body");
                Err(AuthError::Validation(vec![body_error(&rejection)]))
            }
        }
    }
}

fn body_error(rejection: &JsonRejection) -> FieldError {
    let message = match rejection {
        JsonRejection::JsonDataError(_) => "is missing a field or has a field of the wrong type",
        JsonRejection::JsonSyntaxError(_) => "must be valid JSON",
        JsonRejection::MissingJsonContentType(_) => "must be sent as application/json",
        _ => "could not be read",
    };
    FieldError::new("body", message)
}

/// Path extractor whose rejections use the validation error shape.
pub struct ValidatedPath<T>(pub T);

impl<S, T> FromRequestParts<S> for ValidatedPath<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(value)) => Ok(Self(value)),
            Err(rejection) => {
                tracing::debug!(reason = %rejection.body_text(), "rejected path parameters");
                Err(AuthError::Validation(vec![FieldError::new(
                    "path",
                    "must be a valid identifier",
                )]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use axum::body::to_bytes;
    use serde_json::Value;

    #[test]
    fn status_and_code_table_is_stable() {
        let cases = [
            (AuthError::DuplicateUser, 409, "duplicate_user"),
            (AuthError::InvalidCredentials, 401, "invalid_credentials"),
            (AuthError::Unauthorized, 401, "unauthorized"),
            (AuthError::Forbidden, 403, "forbidden"),
            (AuthError::SessionNotFound, 404, "session_not_found"),
            (AuthError::UserNotFound, 404, "user_not_found"),
            (AuthError::Validation(Vec::new()), 400, "validation_error"),
            (AuthError::Internal(anyhow!("boom")), 500, "server_error"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status, "{err:?}");
            assert_eq!(err.code(), code);
        }
    }

    #[tokio::test]
    async fn validation_errors_carry_field_details() {
        let response = AuthError::Validation(vec![FieldError::new(
            "password",
            "must be at least 8 characters long",
        )])
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "validation_error");
        assert_eq!(json["details"][0]["field"], "password");
    }

    #[tokio::test]
    async fn internal_errors_do_not_leak_their_message() {
        let response = AuthError::Internal(anyhow!("connection refused by 10.0.0.5")).into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains("10.0.0.5"));
        assert!(text.contains("server_error"));
    }
}
