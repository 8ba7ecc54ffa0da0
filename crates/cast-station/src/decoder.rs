//! Out-of-process audio decoding.
//!
//! The engine only sees the `FrameSource`/`DecoderFactory` seam; the real
//! implementation shells out to FFmpeg decoding to raw s16le stereo 48 kHz
//! on stdout. A trailing partial frame at EOF is discarded rather than
//! zero-padded.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

use cast_proto::frame::{CHANNELS, FRAME_BYTES, SAMPLE_RATE};

#[async_trait]
pub trait FrameSource: Send {
    /// Next 4096-byte PCM frame, or None at end of stream.
    async fn read_frame(&mut self) -> Option<Vec<u8>>;
}

#[async_trait]
pub trait DecoderFactory: Send + Sync {
    async fn open(&self, path: &Path) -> anyhow::Result<Box<dyn FrameSource>>;
}

pub struct FfmpegDecoder {
    _child: Child,
    stdout: ChildStdout,
}

impl FfmpegDecoder {
    pub fn spawn(path: &Path) -> anyhow::Result<Self> {
        let mut child = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-i")
            .arg(path)
            .arg("-f")
            .arg("s16le")
            .arg("-ac")
            .arg(CHANNELS.to_string())
            .arg("-ar")
            .arg(SAMPLE_RATE.to_string())
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn ffmpeg decoder: {e}"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("ffmpeg decoder stdout missing"))?;
        Ok(Self {
            _child: child,
            stdout,
        })
    }
}

#[async_trait]
impl FrameSource for FfmpegDecoder {
    async fn read_frame(&mut self) -> Option<Vec<u8>> {
        let mut frame = vec![0u8; FRAME_BYTES];
        match self.stdout.read_exact(&mut frame).await {
            Ok(_) => Some(frame),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Partial tail under one frame period; dropped.
                None
            }
            Err(e) => {
                debug!("decoder read error: {e}");
                None
            }
        }
    }
}

pub struct FfmpegDecoderFactory;

#[async_trait]
impl DecoderFactory for FfmpegDecoderFactory {
    async fn open(&self, path: &Path) -> anyhow::Result<Box<dyn FrameSource>> {
        if !path.is_file() {
            anyhow::bail!("audio file not found: {}", path.display());
        }
        Ok(Box::new(FfmpegDecoder::spawn(path)?))
    }
}
