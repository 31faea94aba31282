use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
};
use crate::model::UserContext;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_NAME_HEADER: &str = "x-user-name";

/// Axum extractor for the acting user.
///
/// Reads `X-User-Id` (plus optional `X-User-Email` / `X-User-Name`). A
/// request without any user header runs as the development user; a present
/// but blank or non-UTF-8 user id is rejected with 400.
#[async_trait]
impl<S> FromRequestParts<S> for UserContext
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        user_from_headers(&parts.headers)
    }
}

fn user_from_headers(headers: &HeaderMap) -> Result<UserContext, StatusCode> {
    let Some(raw) = headers.get(USER_ID_HEADER) else {
        return Ok(UserContext::development());
    };

    let user_id = raw
        .to_str()
        .map(str::trim)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    if user_id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    Ok(UserContext::new(user_id)
        .with_email(header_value(headers, USER_EMAIL_HEADER))
        .with_display_name(header_value(headers, USER_NAME_HEADER)))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
