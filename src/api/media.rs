//! Media proxy: `GET /api/media/{channel}/{media_id}` with `Range` support.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::{ApiError, AppState};
use crate::channels::{ByteRange, MediaBody};
use crate::identity::model::Channel;

pub async fn fetch(
    State(state): State<AppState>,
    Path((channel, media_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let channel: Channel = channel
        .parse()
        .map_err(|e: String| ApiError::not_found(e))?;

    // An unparseable Range is ignored and the full body served.
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRange::parse);

    let fetcher = state.channels.fetcher(channel)?;
    let body = fetcher.fetch(&media_id, range).await?;
    debug!(
        channel = channel.as_str(),
        media_id = %media_id,
        bytes = body.bytes.len(),
        partial = body.range.is_some(),
        "Media fetched"
    );
    Ok(media_response(body))
}

/// `206` with `Content-Range` for a ranged body, else `200`.
fn media_response(body: MediaBody) -> Response {
    let content_type = HeaderValue::from_str(&body.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let status = match body.range {
        Some((start, end)) => {
            let total = body
                .total_len
                .map(|t| t.to_string())
                .unwrap_or_else(|| "*".to_string());
            if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{total}")) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            StatusCode::PARTIAL_CONTENT
        }
        None => StatusCode::OK,
    };

    (status, headers, body.bytes).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranged_body_is_partial_content() {
        let response = media_response(MediaBody {
            bytes: vec![0; 10],
            content_type: "audio/ogg".into(),
            total_len: Some(100),
            range: Some((0, 9)),
        });
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-9/100");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/ogg");
    }

    #[test]
    fn full_body_is_ok_with_content_type() {
        let response = media_response(MediaBody {
            bytes: vec![1, 2, 3],
            content_type: "image/jpeg".into(),
            total_len: None,
            range: None,
        });
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    }
}
