use axum::{body::Body, response::Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::proxy::handlers::errors::streaming_error_frame;

/// Standard SSE response envelope; every record the body yields is already a
/// complete line, records end with a blank line.
pub fn build_sse_response(body: Body, account_id: &str) -> Response {
    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Qwen-Account", account_id)
        .body(body)
        .unwrap()
}

/// Convert the dispatcher's fallible line stream into a body stream: a
/// mid-stream failure becomes one terminal `event: error` frame and the
/// stream closes.
pub fn guard_stream<S>(
    stream: S,
) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>> + Send
where
    S: Stream<Item = Result<Bytes, String>> + Send,
{
    stream.scan(false, |errored, item| {
        if *errored {
            return futures::future::ready(None);
        }
        let out = match item {
            Ok(bytes) => bytes,
            Err(message) => {
                *errored = true;
                tracing::warn!("[Stream] Upstream error mid-stream: {}", message);
                streaming_error_frame(&message)
            }
        };
        futures::future::ready(Some(Ok(out)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_mid_stream_emits_terminal_frame_and_closes() {
        let lines = vec![
            Ok(Bytes::from_static(b"data: 1\n")),
            Err("connection reset".to_string()),
            Ok(Bytes::from_static(b"data: never\n")),
        ];
        let out: Vec<Bytes> = guard_stream(futures::stream::iter(lines))
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(out.len(), 2);
        assert_eq!(&out[0][..], b"data: 1\n");
        let tail = String::from_utf8(out[1].to_vec()).unwrap();
        assert!(tail.starts_with("event: error\n"));
        assert!(tail.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn clean_stream_passes_through() {
        let lines = vec![
            Ok(Bytes::from_static(b"data: [DONE]\n")),
            Ok(Bytes::from_static(b"\n")),
        ];
        let out: Vec<Bytes> = guard_stream(futures::stream::iter(lines))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out.len(), 2);
    }
}
