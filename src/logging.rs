use std::{env, time::Instant};

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

use crate::http::headers::SESSION_HEADER;

/// `RUST_LOG` wins; `LOG_LEVEL` is accepted as a plain level; default `info`.
pub fn log_filter(rust_log: Option<&str>, log_level: Option<&str>) -> EnvFilter {
    if let Some(filter) = rust_log
        .map(str::trim)
        .filter(|directives| !directives.is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
    {
        return filter;
    }

    let level = log_level
        .map(|level| level.trim().to_ascii_lowercase())
        .map(|level| match level.as_str() {
            "warning" => "warn".to_string(),
            "critical" | "fatal" => "error".to_string(),
            _ => level,
        })
        .and_then(|level| level.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::INFO);
    EnvFilter::new(level.to_string())
}

/// Logs go to stderr; stdout belongs to the stdio transport.
pub fn init_logging() {
    let rust_log = env::var("RUST_LOG").ok();
    let log_level = env::var("LOG_LEVEL").ok();
    let filter = log_filter(rust_log.as_deref(), log_level.as_deref());
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let session_id = request
        .headers()
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis();

    info!(
        method = %method,
        path = %path,
        session_id = session_id.as_deref().unwrap_or("-"),
        status = status.as_u16(),
        duration_ms = elapsed_ms,
        "request summary"
    );

    if status.as_u16() == 404 && path == "/mcp" {
        warn!(
            method = %method,
            session_id = session_id.as_deref().unwrap_or("-"),
            "unknown mcp session"
        );
    }

    response
}
