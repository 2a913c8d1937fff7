use crate::core::auth::extract_credential;
use crate::core::config::AppState;
use crate::core::ctx::Ctx;
use crate::core::error::Result;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::debug;

pub async fn mw_require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    debug!("MIDDLEWARE: require_auth");

    let credential = extract_credential(req.headers(), None);
    let identity = state.auth.authenticate(credential.as_deref()).await?;

    req.extensions_mut().insert(Ctx::new(identity));

    Ok(next.run(req).await)
}
