//! End-to-end: producer → hub → HTTP/MJPEG/WebSocket clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;

use traffic_streamer::config::{Config, DetectorKind, SourceKind, StaticDetection};
use traffic_streamer::hub::{Hub, HubOptions};
use traffic_streamer::pipeline::Producer;
use traffic_streamer::server::{self, AppState};
use traffic_streamer::stats::PipelineStats;
use traffic_streamer::telemetry;

struct TestStack {
    addr: SocketAddr,
    hub: Hub,
    producer: Producer,
    server: JoinHandle<anyhow::Result<()>>,
}

async fn start_stack() -> TestStack {
    telemetry::init_metrics_recorder();

    let mut config = Config::default();
    config.source.kind = SourceKind::Pattern;
    config.source.frame_width = 320;
    config.source.frame_height = 240;
    config.detector.kind = DetectorKind::Static;
    config.detector.detections = vec![StaticDetection {
        label: "car".into(),
        confidence: 0.8,
        bbox: [40.0, 40.0, 60.0, 30.0],
    }];
    config.pipeline.target_fps = 20.0;
    config.validate().unwrap();

    let hub = Hub::new(HubOptions {
        push_backlog: config.hub.push_backlog,
        cycle_period: config.cycle_period(),
    });
    let stats = Arc::new(PipelineStats::default());
    let producer = Producer::spawn(config, hub.clone(), stats.clone())
        .await
        .unwrap();

    let listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(server::serve(listener, AppState::new(hub.clone(), stats)));

    TestStack {
        addr,
        hub,
        producer,
        server,
    }
}

async fn wait_for_snapshot(addr: SocketAddr) -> serde_json::Value {
    let url = format!("http://{addr}/api/snapshot");
    for _ in 0..100 {
        let resp = reqwest::get(&url).await.unwrap();
        if resp.status() == reqwest::StatusCode::OK {
            return resp.json().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no snapshot published");
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_endpoints() {
    let stack = start_stack().await;
    let addr = stack.addr;

    let snapshot = wait_for_snapshot(addr).await;
    assert_eq!(snapshot["vehicle_count"], 1);
    assert_eq!(snapshot["congestion_tier"], "LOW");
    assert!(snapshot["signal"]["phase"].is_string());
    assert!(snapshot["loop_number"].as_u64().unwrap() >= 1);

    let frame = reqwest::get(format!("http://{addr}/frame.jpg")).await.unwrap();
    assert_eq!(frame.headers()["content-type"], "image/jpeg");
    let body = frame.bytes().await.unwrap();
    assert_eq!(&body[..2], &[0xFF, 0xD8]);

    let status: serde_json::Value = reqwest::get(format!("http://{addr}/api/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(status["pipeline"]["frames_published"].as_u64().unwrap() >= 1);

    let index = reqwest::get(format!("http://{addr}/")).await.unwrap();
    assert!(index.text().await.unwrap().contains("/video_feed"));

    let metrics = reqwest::get(format!("http://{addr}/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("traffic_frames_published_total"));

    stack.hub.shutdown();
    stack.producer.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mjpeg_stream_delivers_whole_parts() {
    let stack = start_stack().await;
    let addr = stack.addr;
    wait_for_snapshot(addr).await;

    let mut resp = reqwest::get(format!("http://{addr}/video_feed")).await.unwrap();
    assert_eq!(
        resp.headers()["content-type"],
        "multipart/x-mixed-replace; boundary=frame"
    );

    let mut buf = Vec::new();
    let part = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let chunk = resp.chunk().await.unwrap().expect("stream ended early");
            buf.extend_from_slice(&chunk);

            let Some(head_end) = find(&buf, b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
            let len: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            let body_start = head_end + 4;
            if buf.len() >= body_start + len {
                return (head, buf[body_start..body_start + len].to_vec());
            }
        }
    })
    .await
    .expect("no complete part within 5s");

    let (head, jpeg) = part;
    assert!(head.starts_with("--frame\r\nContent-Type: image/jpeg"));
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);

    stack.hub.shutdown();
    stack.producer.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_push_channel_and_shutdown() {
    let stack = start_stack().await;
    let addr = stack.addr;
    wait_for_snapshot(addr).await;

    let (mut ws, _response) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("WebSocket connect failed");

    let mut frame_numbers = Vec::new();
    while frame_numbers.len() < 3 {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no push message within 5s")
            .unwrap()
            .unwrap();
        if let tungstenite::Message::Text(text) = msg {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            for key in [
                "timestamp",
                "vehicle_count",
                "rolling_average",
                "congestion_tier",
                "signal",
                "frame_number",
                "loop_number",
                "fps",
            ] {
                assert!(value.get(key).is_some(), "missing {key}");
            }
            frame_numbers.push(value["frame_number"].as_u64().unwrap());
        }
    }
    assert!(frame_numbers.windows(2).all(|w| w[0] <= w[1]));

    stack.hub.shutdown();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(tungstenite::Message::Close(_)) | Err(_) => return true,
                Ok(_) => {}
            }
        }
        true
    })
    .await
    .unwrap_or(false);
    assert!(closed, "push socket not closed on shutdown");

    let served = tokio::time::timeout(Duration::from_secs(5), stack.server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(served.is_ok());

    stack.producer.stop().await;
}
