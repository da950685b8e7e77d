// src/routes/mod.rs

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::error::CoreError;
use crate::services::permission::Actor;
use crate::AppState;

pub mod admin;
pub mod health;
pub mod reports;
pub mod workorders;

pub type ApiResult<T> = Result<axum::Json<T>, CoreError>;

/// Header carrying the authenticated username, set by the upstream gateway.
pub const USER_HEADER: &str = "x-mes-user";
pub const SUPERUSER_HEADER: &str = "x-mes-superuser";

// ─── Actor extraction ───────────────────────────────────────────────────────

fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, CoreError> {
    let username = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CoreError::denied(format!("missing {USER_HEADER} header")))?;

    let is_superuser = headers
        .get(SUPERUSER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    Ok(Actor {
        username: username.to_string(),
        is_superuser,
    })
}

#[async_trait]
impl FromRequestParts<AppState> for Actor {
    type Rejection = CoreError;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn actor_needs_a_username() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            actor_from_headers(&headers),
            Err(CoreError::PermissionDenied(_))
        ));

        headers.insert(USER_HEADER, HeaderValue::from_static("  "));
        assert!(actor_from_headers(&headers).is_err());

        headers.insert(USER_HEADER, HeaderValue::from_static("op-17"));
        assert_eq!(actor_from_headers(&headers).expect("actor"), Actor::user("op-17"));
    }

    #[test]
    fn superuser_flag_is_opt_in() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_static("lead"));
        headers.insert(SUPERUSER_HEADER, HeaderValue::from_static("TRUE"));
        assert!(actor_from_headers(&headers).expect("actor").is_superuser);

        headers.insert(SUPERUSER_HEADER, HeaderValue::from_static("nope"));
        assert!(!actor_from_headers(&headers).expect("actor").is_superuser);
    }
}
