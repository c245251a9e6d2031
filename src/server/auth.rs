use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::server::convert_errors;
use crate::server::responses::ApiError;
use crate::state::State as AppState;
use crate::storage::entities::User;

const API_KEY_SCHEME: &str = "ApiKey";

/// Extracts the key from `Authorization: ApiKey <key>`.
pub fn api_key(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("no authorization header included".into()))?;
    let value = value
        .to_str()
        .map_err(|_| ApiError::Unauthorized("malformed authorization header".into()))?;

    let Some((scheme, key)) = value.split_once(' ') else {
        return Err(ApiError::Unauthorized("malformed authorization header".into()));
    };

    if scheme != API_KEY_SCHEME {
        return Err(ApiError::Unauthorized(format!(
            "{API_KEY_SCHEME} not found in authorization header"
        )));
    }

    match key.trim() {
        "" => Err(ApiError::Unauthorized("malformed authorization header".into())),
        key => Ok(key),
    }
}

/// The user identified by the request's API key.
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let key = api_key(&parts.headers)?;

        let user = convert_errors(async {
            let mut tx = state.storage.begin().await?;
            let user = tx.get_user_by_api_key(key).await?;
            tx.commit().await?;

            Ok(user)
        })
        .await?;

        user.map(AuthUser)
            .ok_or_else(|| ApiError::Unauthorized("unknown API key".into()))
    }
}
