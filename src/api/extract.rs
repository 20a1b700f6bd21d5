//! Request extractors
//!
//! `LocalUser` resolves the `~username` path segment, `ApiKeyUser` the
//! bearer API key.

use std::collections::HashMap;

use axum::async_trait;
use axum::extract::{FromRef, FromRequestParts, Path};
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};

use crate::AppState;
use crate::error::AppError;
use crate::identity::User;

/// The local user named by the `:handle` path parameter
///
/// Handles are `~username`; anything else is 404.
#[derive(Debug, Clone)]
pub struct LocalUser(pub User);

#[async_trait]
impl<S> FromRequestParts<S> for LocalUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(params) = Path::<HashMap<String, String>>::from_request_parts(parts, state)
            .await
            .map_err(|_| AppError::NotFound)?;

        let username = params
            .get("handle")
            .and_then(|handle| handle.strip_prefix('~'))
            .filter(|username| !username.is_empty())
            .ok_or(AppError::NotFound)?;

        let state = AppState::from_ref(state);
        let user = state.identity.get_user_by_username(username).await?;
        Ok(LocalUser(user))
    }
}

/// The user owning the `Authorization: Bearer $id.$value` key
#[derive(Debug, Clone)]
pub struct ApiKeyUser(pub User);

#[async_trait]
impl<S> FromRequestParts<S> for ApiKeyUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::Unauthorized)?;

        let state = AppState::from_ref(state);
        let user = state.identity.validate_api_key(bearer.token()).await?;
        Ok(ApiKeyUser(user))
    }
}
