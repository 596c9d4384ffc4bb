//! Voice demo page: embedded static assets served by the gateway.
//!
//! Uses `rust-embed` to bake the `ui/` directory into the binary.
//! In debug mode (`debug-embed` feature), files are read from disk
//! so you can edit JS/CSS and just refresh the browser.

use axum::{
    extract::Path,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use rust_embed::Embed;

#[derive(Embed)]
#[folder = "ui/"]
struct UiAssets;

/// Build an axum `Router` that serves the embedded demo page.
///
/// Register this **after** `/ws` and `/health` so those routes take priority
/// over the catch-all.
pub fn ui_router() -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/{*path}", get(static_handler))
}

async fn index_handler() -> Response {
    serve_asset("index.html").unwrap_or_else(not_found)
}

async fn static_handler(Path(path): Path<String>) -> Response {
    serve_asset(&path).unwrap_or_else(not_found)
}

fn serve_asset(path: &str) -> Option<Response> {
    let asset = UiAssets::get(path)?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Some(
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, mime.as_ref())],
            asset.data.into_owned(),
        )
            .into_response(),
    )
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Html("<h1>404</h1>")).into_response()
}
