//! `X-API-Key` authentication middleware for the management API (§6).

use super::ApiContext;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

pub async fn require_api_key(State(ctx): State<ApiContext>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let expected = { ctx.state.lock().await.config.api_key.clone() };

    let provided = req
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if expected.is_empty() || provided != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}
