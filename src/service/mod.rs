pub mod purge;
pub mod status;

use http::{header, Response, StatusCode};
use serde::Serialize;

/// Serializes `body` as the JSON payload of a response with `status`.
pub(crate) fn json_response<T: Serialize>(
    status: StatusCode,
    body: &T,
    extra_headers: &[(&'static str, String)],
) -> Response<Vec<u8>> {
    let json_body = serde_json::to_vec(body).unwrap_or_else(|e| {
        log::error!("Failed to serialize response body: {e}");
        b"{}".to_vec()
    });

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in extra_headers {
        builder = builder.header(*name, value.as_str());
    }

    builder.body(json_body).unwrap_or_else(|e| {
        log::error!("Failed to build HTTP response: {e}");
        let mut response = Response::new(b"Internal Server Error".to_vec());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

pub(crate) fn not_found_response() -> Response<Vec<u8>> {
    let mut response = Response::new(b"Not Found".to_vec());
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
