//! WebM/VP9 video writer backed by the system `ffmpeg` binary
//!
//! Frames are streamed as packed 8-bit pixels over ffmpeg's stdin. The child
//! process is always reaped: `finish` waits and reports ffmpeg's stderr on
//! failure, and dropping an unfinished writer closes stdin and waits too.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::postprocess::ChannelOrder;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Invalid encoder settings: {0}")]
    Validation(String),

    #[error("ffmpeg is required for WebM encoding, but was not found on PATH")]
    FfmpegMissing,

    #[error("Failed to create output directory '{}'", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to write frame {index} to ffmpeg: {source}")]
    Write {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Writer already finished")]
    Finished,

    #[error("ffmpeg exited with status {status}: {stderr}")]
    Ffmpeg { status: String, stderr: String },

    #[error("Failed to wait for ffmpeg: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct VideoWriterConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub out_path: PathBuf,
    pub channel_order: ChannelOrder,
    pub overwrite: bool,
}

impl VideoWriterConfig {
    pub fn new(out_path: impl Into<PathBuf>, width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            out_path: out_path.into(),
            channel_order: ChannelOrder::Rgb,
            overwrite: true,
        }
    }

    pub fn with_channel_order(mut self, order: ChannelOrder) -> Self {
        self.channel_order = order;
        self
    }

    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.width == 0 || self.height == 0 {
            return Err(EncodeError::Validation(
                "frame width/height must be non-zero".to_string(),
            ));
        }
        if self.fps == 0 {
            return Err(EncodeError::Validation("fps must be non-zero".to_string()));
        }
        Ok(())
    }
}

pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn ensure_parent_dir(path: &Path) -> Result<(), EncodeError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| EncodeError::OutputDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

pub struct VideoWriter {
    cfg: VideoWriterConfig,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    frames_written: usize,
}

impl VideoWriter {
    pub fn new(cfg: VideoWriterConfig) -> Result<Self, EncodeError> {
        cfg.validate()?;
        ensure_parent_dir(&cfg.out_path)?;

        if !is_ffmpeg_on_path() {
            return Err(EncodeError::FfmpegMissing);
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd.arg(if cfg.overwrite { "-y" } else { "-n" });
        cmd.args([
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            cfg.channel_order.pix_fmt(),
            "-s",
            &format!("{}x{}", cfg.width, cfg.height),
            "-r",
            &cfg.fps.to_string(),
            "-i",
            "pipe:0",
            "-an",
            "-c:v",
            "libvpx-vp9",
            "-pix_fmt",
            "yuv420p",
            "-f",
            "webm",
        ])
        .arg(&cfg.out_path);

        let mut child = cmd.spawn().map_err(EncodeError::Spawn)?;
        let stdin = child.stdin.take();
        info!(
            path = %cfg.out_path.display(),
            width = cfg.width,
            height = cfg.height,
            fps = cfg.fps,
            "Opened video writer"
        );

        Ok(Self {
            cfg,
            child: Some(child),
            stdin,
            frames_written: 0,
        })
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    pub fn write_frame(&mut self, frame: &RgbImage) -> Result<(), EncodeError> {
        if frame.width() != self.cfg.width || frame.height() != self.cfg.height {
            return Err(EncodeError::Validation(format!(
                "frame size mismatch: got {}x{}, expected {}x{}",
                frame.width(),
                frame.height(),
                self.cfg.width,
                self.cfg.height
            )));
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(EncodeError::Finished);
        };

        let bytes = self.cfg.channel_order.pack(frame);
        stdin.write_all(&bytes).map_err(|source| EncodeError::Write {
            index: self.frames_written,
            source,
        })?;
        self.frames_written += 1;
        Ok(())
    }

    /// Close the stream and wait for ffmpeg to finalize the container
    pub fn finish(mut self) -> Result<(), EncodeError> {
        drop(self.stdin.take());
        let Some(child) = self.child.take() else {
            return Err(EncodeError::Finished);
        };

        let output = child.wait_with_output().map_err(EncodeError::Wait)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EncodeError::Ffmpeg {
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        debug!(frames = self.frames_written, "Video writer finished");
        Ok(())
    }
}

impl Drop for VideoWriter {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) if !status.success() => {
                    warn!(%status, path = %self.cfg.out_path.display(), "ffmpeg exited with failure");
                }
                Err(e) => warn!(error = %e, "Failed to reap ffmpeg"),
                _ => {}
            }
        }
    }
}

/// Write all frames to `path` in one go
pub fn write_video(
    path: impl Into<PathBuf>,
    frames: &[RgbImage],
    fps: u32,
    channel_order: ChannelOrder,
) -> Result<(), EncodeError> {
    let Some(first) = frames.first() else {
        return Err(EncodeError::Validation("no frames to write".to_string()));
    };
    let cfg = VideoWriterConfig::new(path, first.width(), first.height(), fps)
        .with_channel_order(channel_order);
    let mut writer = VideoWriter::new(cfg)?;
    for frame in frames {
        writer.write_frame(frame)?;
    }
    writer.finish()
}
