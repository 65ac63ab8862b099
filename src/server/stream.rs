use std::convert::Infallible;

use async_stream::stream;
use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};

use super::AppState;
use crate::hub::FramePacket;

pub const BOUNDARY: &str = "frame";

/// One multipart part: boundary, headers, JPEG body.
pub fn mjpeg_part(packet: &FramePacket) -> Bytes {
    let head = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        packet.jpeg.len()
    );
    let mut part = BytesMut::with_capacity(head.len() + packet.jpeg.len() + 2);
    part.put_slice(head.as_bytes());
    part.put_slice(&packet.jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// `GET /video_feed`. Each part carries the newest frame at the moment the
/// previous part was taken; frames published in between are skipped.
pub async fn video_feed(State(state): State<AppState>) -> Response {
    let guard = state.hub.image_client();
    let mut frames = state.hub.frames();
    let shutdown = state.hub.shutdown_token();

    let body = stream! {
        let _guard = guard;
        let mut last_sent = None;
        loop {
            let latest = frames.borrow_and_update().clone();
            if let Some(packet) = latest {
                if last_sent != Some(packet.sequence) {
                    last_sent = Some(packet.sequence);
                    yield Ok::<Bytes, Infallible>(mjpeg_part(&packet));
                }
            }
            tokio::select! {
                changed = frames.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    };

    (
        [
            (
                header::CONTENT_TYPE,
                "multipart/x-mixed-replace; boundary=frame",
            ),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_part_layout() {
        let packet = FramePacket {
            jpeg: Bytes::from_static(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9]),
            sequence: 9,
            frame_number: 9,
            loop_number: 1,
            captured_at: Utc::now(),
        };
        let part = mjpeg_part(&packet);

        let expected_head = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 5\r\n\r\n";
        assert!(part.starts_with(expected_head));
        assert_eq!(&part[expected_head.len()..expected_head.len() + 5], &packet.jpeg[..]);
        assert!(part.ends_with(b"\r\n"));
    }
}
