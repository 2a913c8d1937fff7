//! Request context for authenticated HTTP routes.
//!
//! `mw_require_auth` resolves the caller once and parks the resulting
//! [`Ctx`] in the request extensions; handlers take it as an extractor.
//! A route that extracts `Ctx` without the middleware in front of it is
//! rejected as unauthenticated.

use crate::core::error::{Error, Result};
use crate::core::models::Identity;
use axum::{extract::FromRequestParts, http::request::Parts};

#[derive(Clone, Debug)]
pub struct Ctx {
    identity: Identity,
}

impl Ctx {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl<S> FromRequestParts<S> for Ctx
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<Ctx>()
            .cloned()
            .ok_or_else(|| Error::Authentication("request context missing".to_string()))
    }
}
