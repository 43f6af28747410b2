use crate::{
    error::{PostcacheError, Result},
    server::state::AppState,
};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use std::time::Duration;
use tracing::{debug, info};

/// Response header carrying the cache outcome
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// `X-Cache` value for requests that bypass the cache
pub const CANT_CACHE: &str = "CANT-CACHE";

/// Headers that describe one connection and must not be forwarded
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Proxy every request that is not a reserved postcache endpoint.
///
/// POST requests go through the cache; anything else is forwarded verbatim.
pub async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    if method != Method::POST {
        return passthrough(&state, method, path_and_query, &headers, body).await;
    }

    let cached = state.coordinator.serve(path_and_query, body).await?;
    info!("POST {} cache: {}", path_and_query, cached.status);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json"),
            (X_CACHE, cached.status.as_str()),
        ],
        Body::from(cached.payload),
    )
        .into_response())
}

/// Forward a non-cacheable request to the origin and relay its response.
async fn passthrough(
    state: &AppState,
    method: Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let url = state.origin.url_for(path_and_query)?;
    debug!("Passing {} {} through to {}", method, path_and_query, url);

    let mut request = state
        .origin
        .client()
        .request(method.clone(), url)
        .timeout(Duration::from_secs(state.config.origin_timeout_secs))
        .body(body);
    for (name, value) in headers {
        if is_hop_by_hop(name) || *name == header::HOST || *name == header::CONTENT_LENGTH {
            continue;
        }
        request = request.header(name, value);
    }

    let response = request.send().await?;
    state.metrics.record_cant_cache();
    info!(
        "{} {} cache: {} ({})",
        method,
        path_and_query,
        CANT_CACHE,
        response.status()
    );

    let mut builder = Response::builder().status(response.status());
    for (name, value) in response.headers() {
        if !is_hop_by_hop(name) {
            builder = builder.header(name, value);
        }
    }
    builder = builder.header(X_CACHE, CANT_CACHE);

    let bytes = response.bytes().await?;
    builder
        .body(Body::from(bytes))
        .map_err(|e| PostcacheError::Internal(format!("Failed to build passthrough response: {}", e)))
}
