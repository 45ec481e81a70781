//! `multipart/x-mixed-replace` MJPEG responder

use axum::{
    body::Body,
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE, EXPIRES, PRAGMA},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::app_state::AppState;
use crate::buffer::Frame;

pub const BOUNDARY: &str = "frame";

/// One multipart section carrying a JPEG frame
pub fn frame_part(frame: &Frame) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Frame-Sequence: {}\r\n\r\n",
        BOUNDARY,
        frame.data.len(),
        frame.sequence
    );

    let mut part = BytesMut::with_capacity(header.len() + frame.data.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(&frame.data);
    part.put_slice(b"\r\n");
    part.freeze()
}

struct Cursor {
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
    poll: Duration,
    /// (generation, sequence) of the last frame sent to this client
    last_sent: Option<(u64, u64)>,
}

impl Cursor {
    /// Waits for a frame this client has not seen yet; `None` ends the stream
    async fn next_part(&mut self) -> Option<Bytes> {
        loop {
            if *self.shutdown.borrow() {
                return None;
            }

            // Empty and stale buffers just mean "try again next tick"
            if let Ok(frame) = self.state.camera.peek() {
                let key = (frame.generation, frame.sequence);
                if self.last_sent != Some(key) {
                    self.last_sent = Some(key);
                    return Some(frame_part(&frame));
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

/// Streams frames to one client until it disconnects or the server shuts down
pub fn stream_response(state: Arc<AppState>, poll: Duration) -> Response {
    let cursor = Cursor {
        shutdown: state.shutdown_signal(),
        state,
        poll,
        last_sent: None,
    };

    let frames = stream::unfold(cursor, |mut cursor| async move {
        let part = cursor.next_part().await;
        if part.is_none() {
            debug!("MJPEG stream finished");
        }
        part.map(|part| (Ok::<_, Infallible>(part), cursor))
    });

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("multipart/x-mixed-replace; boundary=frame"),
    );
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));

    (StatusCode::OK, headers, Body::from_stream(frames)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Instant, SystemTime};

    #[test]
    fn test_frame_part_layout() {
        let frame = Frame {
            data: Bytes::from_static(&[0xff, 0xd8, 0xff, 0xd9]),
            sequence: 1,
            generation: 1,
            captured_at: Instant::now(),
            captured_wall: SystemTime::now(),
            width: 1,
            height: 1,
        };

        let part = frame_part(&frame);
        let expected_header =
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\nX-Frame-Sequence: 1\r\n\r\n";
        assert!(part.starts_with(expected_header));
        assert_eq!(&part[expected_header.len()..], &[0xff, 0xd8, 0xff, 0xd9, b'\r', b'\n']);
    }
}
