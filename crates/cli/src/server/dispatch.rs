//! Method dispatch for everything outside `/time` and `/takedown/`.

use super::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use live_origin_core::gateway::{self, Resolved};
use live_origin_core::limiter::throttle;
use live_origin_core::{Error, ResourcePath};
use tracing::{debug, error, info, warn};

/// Bytes read from disk per response chunk
const READ_CHUNK: usize = 64 * 1024;

pub async fn handle(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    body: Body,
) -> Response {
    let path = match ResourcePath::from_uri_path(uri.path()) {
        Ok(path) => path,
        Err(err) => {
            warn!(uri = %uri, error = %err, "Rejected request path");
            return error_response(&err);
        }
    };

    match method {
        Method::PUT | Method::POST => ingest(&state, &path, body).await,
        Method::GET | Method::HEAD => serve(&state, &path, &uri).await,
        Method::DELETE => delete(&state, &path).await,
        _ => {
            debug!(%method, path = %path, "Unhandled method");
            StatusCode::OK.into_response()
        }
    }
}

/// HTTP status for a store error
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidPath(_) => StatusCode::BAD_REQUEST,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Aborted { .. } | Error::Closed(_) => StatusCode::GONE,
        Error::Io(_) | Error::ConfigParse(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &Error) -> Response {
    (status_for(err), err.to_string()).into_response()
}

async fn ingest(state: &AppState, path: &ResourcePath, body: Body) -> Response {
    let upload = match state.store.begin_upload(path).await {
        Ok(upload) => upload,
        Err(err) => {
            log_failure(path, &err, "Upload refused");
            return error_response(&err);
        }
    };

    let mut chunks = body.into_data_stream();
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(chunk) => {
                if let Err(err) = upload.append(&chunk).await {
                    log_failure(path, &err, "Upload failed");
                    upload.abort(err.to_string()).await;
                    return error_response(&err);
                }
            }
            Err(err) => {
                // Keep what arrived; readers see a clean end of stream
                warn!(path = %path, written = upload.written(), error = %err, "Client body failed");
                upload.seal().await;
                return StatusCode::BAD_REQUEST.into_response();
            }
        }
    }

    let written = upload.seal().await;
    info!(path = %path, bytes = written, "Upload complete");
    StatusCode::CREATED.into_response()
}

async fn serve(state: &AppState, path: &ResourcePath, uri: &Uri) -> Response {
    let content_type = gateway::content_type_for(path);

    if let Some(reader) = state.store.attach(path) {
        debug!(path = %path, offset = reader.offset(), "Serving live resource");
        let stream = reader.into_stream(READ_CHUNK);
        let body = match state.config.rate_limit_kib {
            0 => Body::from_stream(stream),
            _ => Body::from_stream(throttle(stream, state.bucket())),
        };
        return with_content_type(Response::new(body), content_type);
    }

    match gateway::resolve(state.store.root(), path, uri.path().ends_with('/')).await {
        Resolved::File {
            file, len, hints, ..
        } => {
            let body = match state.config.rate_limit_kib {
                0 => Body::from_stream(gateway::file_stream(file, READ_CHUNK)),
                _ => Body::from_stream(gateway::paced_file_stream(
                    file,
                    READ_CHUNK,
                    state.bucket(),
                )),
            };
            let mut response = with_content_type(Response::new(body), hints.content_type);
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            if let Some(cache_control) = hints.cache_control {
                headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
            }
            response
        }
        Resolved::Redirect => {
            let location = match uri.query() {
                Some(query) => format!("{}/?{}", uri.path(), query),
                None => format!("{}/", uri.path()),
            };
            debug!(path = %path, %location, "Redirecting directory request");
            match HeaderValue::from_str(&location) {
                Ok(location) => {
                    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
                }
                Err(_) => StatusCode::BAD_REQUEST.into_response(),
            }
        }
        Resolved::NotFound => {
            debug!(path = %path, "Not found");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn delete(state: &AppState, path: &ResourcePath) -> Response {
    match state.store.delete(path).await {
        Ok(deleted) => {
            debug!(path = %path, ?deleted, "Delete handled");
            StatusCode::OK.into_response()
        }
        Err(err) => {
            log_failure(path, &err, "Delete failed");
            error_response(&err)
        }
    }
}

fn log_failure(path: &ResourcePath, err: &Error, what: &str) {
    match err {
        Error::Io(_) => error!(path = %path, error = %err, "{}", what),
        _ => warn!(path = %path, error = %err, "{}", what),
    }
}

fn with_content_type(mut response: Response, content_type: Option<&'static str>) -> Response {
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
}
