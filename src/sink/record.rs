//! Recording sink.
//!
//! Appends processed frames to a container file opened at the output geometry and
//! the source frame rate. The codec follows the file extension:
//! - `.y4m`: uncompressed YUV4MPEG2 (4:4:4), written directly, always available
//! - `.mkv`: H.264 in Matroska (feature: gstreamer-media)
//! - anything else: H.264 in MP4 (feature: gstreamer-media)
//!
//! Opening fails fast when the output path or encoder is unusable.

use anyhow::{anyhow, bail, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{fps_rational, FrameSink};
use crate::frame::{clamp_to_u8, Frame, PixelFormat, Resolution};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordCodec {
    Y4m,
    H264Mp4,
    H264Matroska,
}

impl RecordCodec {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("y4m") => Self::Y4m,
            Some("mkv") => Self::H264Matroska,
            _ => Self::H264Mp4,
        }
    }

    pub fn identifier(self) -> &'static str {
        match self {
            Self::Y4m => "yuv4mpeg2/444",
            Self::H264Mp4 => "avc1/mp4",
            Self::H264Matroska => "avc1/matroska",
        }
    }
}

pub struct RecordingSink {
    name: String,
    path: PathBuf,
    writer: RecordWriter,
    frames: u64,
}

enum RecordWriter {
    Y4m(Y4mWriter),
    #[cfg(feature = "gstreamer-media")]
    Encoded(super::appsrc::AppSrcPipeline),
}

impl RecordingSink {
    /// Open `path` for recording at `resolution` and `fps`.
    pub fn create(path: &Path, resolution: Resolution, fps: f64) -> Result<Self> {
        let codec = RecordCodec::from_path(path);
        let writer = match codec {
            RecordCodec::Y4m => RecordWriter::Y4m(Y4mWriter::create(path, resolution, fps)?),
            RecordCodec::H264Mp4 | RecordCodec::H264Matroska => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    if !parent.is_dir() {
                        bail!("recording directory {} does not exist", parent.display());
                    }
                }
                #[cfg(feature = "gstreamer-media")]
                {
                    let description = encoded_pipeline_description(path, codec);
                    RecordWriter::Encoded(super::appsrc::AppSrcPipeline::launch(
                        "recording",
                        &description,
                        resolution,
                        fps,
                    )?)
                }
                #[cfg(not(feature = "gstreamer-media"))]
                {
                    bail!(
                        "{} recording requires the gstreamer-media feature (use a .y4m path)",
                        codec.identifier()
                    )
                }
            }
        };
        log::debug!(
            "RecordingSink: {} opened as {} at {}",
            path.display(),
            codec.identifier(),
            resolution
        );
        Ok(Self {
            name: format!("record:{}", path.display()),
            path: path.to_path_buf(),
            writer,
            frames: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }
}

impl FrameSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        match &mut self.writer {
            RecordWriter::Y4m(writer) => writer.write_frame(frame)?,
            #[cfg(feature = "gstreamer-media")]
            RecordWriter::Encoded(pipeline) => pipeline.push(frame)?,
        }
        self.frames += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match &mut self.writer {
            RecordWriter::Y4m(writer) => writer.finish(),
            #[cfg(feature = "gstreamer-media")]
            RecordWriter::Encoded(pipeline) => pipeline.finish(true),
        }
        .with_context(|| format!("finalize recording {}", self.path.display()))?;
        log::info!(
            "RecordingSink: {} closed after {} frames",
            self.path.display(),
            self.frames
        );
        Ok(())
    }
}

#[cfg(feature = "gstreamer-media")]
fn encoded_pipeline_description(path: &Path, codec: RecordCodec) -> String {
    let muxer = match codec {
        RecordCodec::H264Matroska => "matroskamux",
        _ => "mp4mux",
    };
    format!(
        "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc ! h264parse ! \
         {} ! filesink location=\"{}\"",
        muxer,
        path.display()
    )
}

// ----------------------------------------------------------------------------
// YUV4MPEG2 writer
// ----------------------------------------------------------------------------

struct Y4mWriter {
    out: Option<BufWriter<File>>,
    resolution: Resolution,
    planes: Vec<u8>,
}

impl Y4mWriter {
    fn create(path: &Path, resolution: Resolution, fps: f64) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("create recording file {}", path.display()))?;
        let mut out = BufWriter::new(file);
        let (num, den) = match fps_rational(fps) {
            (0, _) => fps_rational(crate::source::FALLBACK_FPS),
            rate => rate,
        };
        writeln!(
            out,
            "YUV4MPEG2 W{} H{} F{}:{} Ip A1:1 C444",
            resolution.width, resolution.height, num, den
        )
        .context("write y4m header")?;
        Ok(Self {
            out: Some(out),
            resolution,
            planes: Vec::new(),
        })
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.resolution() != self.resolution {
            return Err(anyhow!(
                "recording expects {} frames, got {}",
                self.resolution,
                frame.resolution()
            ));
        }
        if frame.format() != PixelFormat::Rgb24 {
            return Err(anyhow!("recording expects RGB frames, got {:?}", frame.format()));
        }
        let out = self.out.as_mut().context("recording already finalized")?;

        let plane = (self.resolution.width * self.resolution.height) as usize;
        self.planes.clear();
        self.planes.resize(plane * 3, 0);
        let (y_plane, chroma) = self.planes.split_at_mut(plane);
        let (u_plane, v_plane) = chroma.split_at_mut(plane);
        for (i, px) in frame.data().chunks_exact(3).enumerate() {
            let [y, u, v] = rgb_to_yuv(px[0], px[1], px[2]);
            y_plane[i] = y;
            u_plane[i] = u;
            v_plane[i] = v;
        }

        out.write_all(b"FRAME\n").context("write y4m frame header")?;
        out.write_all(&self.planes).context("write y4m frame")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush().context("flush y4m file")?;
        }
        Ok(())
    }
}

/// BT.601 studio-swing conversion, the Y4M default colour space.
fn rgb_to_yuv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    [
        clamp_to_u8(16.0 + 0.257 * r + 0.504 * g + 0.098 * b),
        clamp_to_u8(128.0 - 0.148 * r - 0.291 * g + 0.439 * b),
        clamp_to_u8(128.0 + 0.439 * r - 0.368 * g - 0.071 * b),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_frame(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        let data = rgb.repeat((width * height) as usize);
        Frame::new(data, width, height, PixelFormat::Rgb24).unwrap()
    }

    #[test]
    fn codec_follows_extension() {
        assert_eq!(RecordCodec::from_path(Path::new("a.y4m")), RecordCodec::Y4m);
        assert_eq!(RecordCodec::from_path(Path::new("a.Y4M")), RecordCodec::Y4m);
        assert_eq!(RecordCodec::from_path(Path::new("a.mkv")), RecordCodec::H264Matroska);
        assert_eq!(RecordCodec::from_path(Path::new("a.mp4")), RecordCodec::H264Mp4);
        assert_eq!(RecordCodec::from_path(Path::new("out")), RecordCodec::H264Mp4);
    }

    #[test]
    fn y4m_recording_writes_header_and_frames() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.y4m");
        let mut sink = RecordingSink::create(&path, Resolution::new(4, 2), 25.0)?;
        sink.write(&rgb_frame(4, 2, [255, 255, 255]))?;
        sink.write(&rgb_frame(4, 2, [0, 0, 0]))?;
        sink.close()?;
        assert_eq!(sink.frames_written(), 2);

        let bytes = std::fs::read(&path)?;
        let header = b"YUV4MPEG2 W4 H2 F25:1 Ip A1:1 C444\n";
        assert!(bytes.starts_with(header));
        let frame_len = b"FRAME\n".len() + 4 * 2 * 3;
        assert_eq!(bytes.len(), header.len() + 2 * frame_len);

        // White maps to studio-swing peak luma, black to the floor.
        let first_y = header.len() + b"FRAME\n".len();
        assert_eq!(bytes[first_y], 235);
        assert_eq!(bytes[first_y + frame_len], 16);
        Ok(())
    }

    #[test]
    fn y4m_recording_rejects_wrong_size() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = RecordingSink::create(&dir.path().join("out.y4m"), Resolution::new(4, 2), 30.0)?;
        assert!(sink.write(&rgb_frame(2, 2, [1, 2, 3])).is_err());
        sink.close()?;
        Ok(())
    }

    #[test]
    fn recording_into_missing_directory_fails_fast() {
        let path = Path::new("/nonexistent-framepipe-dir/out.y4m");
        assert!(RecordingSink::create(path, Resolution::new(4, 2), 30.0).is_err());
        let path = Path::new("/nonexistent-framepipe-dir/out.mp4");
        assert!(RecordingSink::create(path, Resolution::new(4, 2), 30.0).is_err());
    }

    #[test]
    fn unknown_rate_falls_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.y4m");
        let mut sink = RecordingSink::create(&path, Resolution::new(2, 2), 0.0)?;
        sink.close()?;
        let bytes = std::fs::read(&path)?;
        assert!(bytes.starts_with(b"YUV4MPEG2 W2 H2 F30:1 "));
        Ok(())
    }
}
