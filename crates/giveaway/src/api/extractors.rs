use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The caller's stable external user id, taken from the `x-user-id` header
/// the auth gateway sets. Session mechanics live upstream; by the time a
/// request reaches this service the id is trusted.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
}

#[derive(Debug)]
pub enum AuthError {
    MissingUserId,
    InvalidUserId,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::MissingUserId => "missing x-user-id header",
            AuthError::InvalidUserId => "invalid x-user-id header",
        };
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": message })),
        )
            .into_response()
    }
}

impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or(AuthError::MissingUserId)?;

        let user_id = value
            .to_str()
            .map_err(|_| AuthError::InvalidUserId)?
            .trim()
            .to_string();
        if user_id.is_empty() {
            return Err(AuthError::InvalidUserId);
        }

        Ok(AuthedUser { user_id })
    }
}
