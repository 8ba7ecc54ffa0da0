//! Silent MP3 material for encoder outages.
//!
//! While the encoder is RESTARTING or FAILED, listeners keep receiving bytes;
//! those bytes come from a chunk rendered once at startup by FFmpeg's
//! `anullsrc` generator, or from a minimal hand-built MP3 frame when FFmpeg
//! is unavailable.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Render `size` bytes of silent MP3 at the configured bitrate.
pub async fn generate_silent_chunk(bitrate: &str, size: usize) -> Vec<u8> {
    match render_with_ffmpeg(bitrate, size).await {
        Ok(data) => {
            debug!(bytes = data.len(), "silent MP3 chunk rendered");
            data
        }
        Err(e) => {
            warn!("silent MP3 render failed, using minimal frame: {e}");
            minimal_chunk(size)
        }
    }
}

async fn render_with_ffmpeg(bitrate: &str, size: usize) -> anyhow::Result<Vec<u8>> {
    // At 128 kbps, size bytes ≈ size*8/128000 seconds; render a little extra.
    let bitrate_bps: u64 = bitrate
        .strip_suffix('k')
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(128)
        * 1000;
    let seconds = ((size as u64 * 8) as f64 / bitrate_bps as f64 * 1.5).max(0.1);

    let output = tokio::time::timeout(
        Duration::from_secs(5),
        Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-f")
            .arg("lavfi")
            .arg("-i")
            .arg("anullsrc=channel_layout=stereo:sample_rate=48000")
            .arg("-t")
            .arg(format!("{seconds:.3}"))
            .arg("-f")
            .arg("mp3")
            .arg("-b:a")
            .arg(bitrate)
            .arg("-acodec")
            .arg("libmp3lame")
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("ffmpeg timed out"))??;

    if !output.status.success() || output.stdout.is_empty() {
        anyhow::bail!("ffmpeg exited with {}", output.status);
    }
    let mut data = output.stdout;
    data.resize(size, 0);
    Ok(data)
}

/// A bare MP3 sync frame padded to size. Decoders treat it as silence.
pub fn minimal_chunk(size: usize) -> Vec<u8> {
    let header: [u8; 11] = [
        0xFF, 0xFB, 0x94, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    let mut chunk = header.to_vec();
    chunk.resize(size.max(header.len()), 0);
    chunk.truncate(size.max(1));
    chunk
}
