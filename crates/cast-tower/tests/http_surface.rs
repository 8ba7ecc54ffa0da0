//! Tower service end-to-end over loopback HTTP and a temp unix socket.
//!
//! No assumptions about FFmpeg being installed: when the encoder cannot
//! start, the fan-out serves the silent chunk, which is exactly the
//! continuity contract these tests pin down.

use std::time::Duration;
use tokio::io::AsyncWriteExt;

use cast_proto::config::TowerConfig;
use cast_proto::frame::FRAME_BYTES;
use cast_proto::wire::{BufferStatus, SourceMode, TowerStatus};
use cast_tower::service::TowerService;

struct Harness {
    service: TowerService,
    base_url: String,
    socket_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

async fn start_tower() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("pcm.sock");
    let config = TowerConfig {
        host: "127.0.0.1".to_string(),
        port: 0, // ephemeral
        socket_path: socket_path.clone(),
        ..TowerConfig::default()
    };
    let service = TowerService::start(config).await.unwrap();
    let base_url = format!("http://{}", service.local_addr);
    Harness {
        service,
        base_url,
        socket_path,
        _dir: dir,
    }
}

#[tokio::test]
async fn stream_starts_within_500ms_and_status_reflects_it() {
    let mut harness = start_tower().await;
    let client = reqwest::Client::new();

    let mut resp = tokio::time::timeout(
        Duration::from_millis(500),
        client.get(format!("{}/stream", harness.base_url)).send(),
    )
    .await
    .expect("headers within 500ms")
    .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "audio/mpeg"
    );
    assert_eq!(
        resp.headers().get("cache-control").unwrap(),
        "no-cache, no-store, must-revalidate"
    );

    let first = tokio::time::timeout(Duration::from_millis(500), resp.chunk())
        .await
        .expect("body bytes within 500ms")
        .unwrap();
    assert!(first.is_some_and(|chunk| !chunk.is_empty()));

    let status: TowerStatus = client
        .get(format!("{}/status", harness.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.source_mode, SourceMode::Tone);
    assert_eq!(status.num_clients, 1);
    assert!(status.uptime_seconds >= 0.0);
    assert!(status.router_queue.is_some());

    harness.service.stop().await;
}

#[tokio::test]
async fn control_source_switches_and_validates() {
    let mut harness = start_tower().await;
    let client = reqwest::Client::new();
    let url = format!("{}/control/source", harness.base_url);

    // tone → silence → tone round trip.
    for mode in ["silence", "tone"] {
        let resp = client
            .post(&url)
            .json(&serde_json::json!({ "mode": mode }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["source_mode"], mode);
    }

    // Unknown mode, malformed JSON, missing file path: all 400 with an error.
    let resp = client
        .post(&url)
        .json(&serde_json::json!({ "mode": "theremin" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "error");

    let resp = client
        .post(&url)
        .json(&serde_json::json!({ "mode": "file" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(&url)
        .json(&serde_json::json!({ "mode": "file", "file_path": "/no/such.wav" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // A failed switch left the old source in place.
    let status: TowerStatus = client
        .get(format!("{}/status", harness.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.source_mode, SourceMode::Tone);

    harness.service.stop().await;
}

#[tokio::test]
async fn unknown_paths_return_404() {
    let mut harness = start_tower().await;
    let resp = reqwest::get(format!("{}/nope", harness.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    harness.service.stop().await;
}

#[tokio::test]
async fn producer_frames_show_up_in_buffer_telemetry() {
    let mut harness = start_tower().await;
    let client = reqwest::Client::new();

    let mut producer = tokio::net::UnixStream::connect(&harness.socket_path)
        .await
        .unwrap();
    // Burst faster than the pump consumes so fill is observable.
    for _ in 0..40 {
        producer.write_all(&vec![0x11u8; FRAME_BYTES]).await.unwrap();
    }

    let mut saw_fill = false;
    for _ in 0..20 {
        let status: BufferStatus = client
            .get(format!("{}/tower/buffer", harness.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(status.capacity > 0);
        if status.fill > 0 {
            saw_fill = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(saw_fill, "buffer fill never became visible");

    harness.service.stop().await;
}
