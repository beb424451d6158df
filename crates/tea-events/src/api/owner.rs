//! Caller identity from request headers.
//!
//! Authentication happens upstream; this service only reads who the caller
//! is. Exactly one of `X-User-ID` and `X-Api-Key-ID` may be present.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{request::Parts, HeaderMap};

use crate::domain::{ApiError, Owner};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const API_KEY_ID_HEADER: &str = "x-api-key-id";

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn owner_from_headers(headers: &HeaderMap) -> Result<Option<Owner>, ApiError> {
    match (header(headers, USER_ID_HEADER), header(headers, API_KEY_ID_HEADER)) {
        (Some(user), None) => Ok(Some(Owner::User(user))),
        (None, Some(key)) => Ok(Some(Owner::ApiKey(key))),
        (None, None) => Ok(None),
        (Some(_), Some(_)) => Err(ApiError::invalid_request(
            "send exactly one of X-User-ID and X-Api-Key-ID",
        )),
    }
}

/// Required caller identity
#[derive(Debug, Clone)]
pub struct Caller(pub Owner);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        owner_from_headers(&parts.headers)?
            .map(Caller)
            .ok_or_else(|| ApiError::unauthorized("missing X-User-ID or X-Api-Key-ID header"))
    }
}

/// Optional caller identity, for push endpoints browsers open without
/// custom headers
#[derive(Debug, Clone)]
pub struct MaybeCaller(pub Option<Owner>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeCaller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        owner_from_headers(&parts.headers).map(MaybeCaller)
    }
}
