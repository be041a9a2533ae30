use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream;

use crate::AppState;

/// SSE stream of index mutations. Frames arrive pre-encoded from the
/// broker; the connection stays open until the client goes away or the
/// server shuts down. Client disconnect drops the subscription, which
/// unregisters it inside the broker loop.
pub async fn subscribe(State(state): State<AppState>) -> Response {
    let subscription = state.broker.subscribe().await;

    let body = Body::from_stream(stream::unfold(subscription, |mut sub| async move {
        let frame = sub.next().await?;
        let chunk = Bytes::copy_from_slice(frame.as_bytes());
        Some((Ok::<_, Infallible>(chunk), sub))
    }));

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}
