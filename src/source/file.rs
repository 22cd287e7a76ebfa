//! Local file backend using FFmpeg.
//!
//! Decodes the best video track of a local file into packed RGB frames, one frame
//! per `read()`. At the end of the container the decoder is flushed so trailing
//! frames are still delivered before `Ok(None)`.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::path::PathBuf;

use super::{CaptureBackend, StreamInfo};
use crate::frame::{Frame, PixelFormat, Resolution};

pub(crate) struct FfmpegFileBackend {
    path: PathBuf,
    state: Option<DecodeState>,
}

struct DecodeState {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    flushed: bool,
}

impl FfmpegFileBackend {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, state: None }
    }
}

impl CaptureBackend for FfmpegFileBackend {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn open(&mut self) -> Result<StreamInfo> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&self.path)
            .with_context(|| format!("failed to open file input '{}'", self.path.display()))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let rate = input_stream.avg_frame_rate();
        let fps = if rate.denominator() == 0 {
            0.0
        } else {
            f64::from(rate)
        };

        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let resolution = Resolution::new(decoder.width(), decoder.height());
        self.state = Some(DecodeState {
            input,
            stream_index,
            decoder,
            scaler,
            flushed: false,
        });
        Ok(StreamInfo::new(resolution, fps))
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let state = self.state.as_mut().context("file not open")?;
        let mut decoded = ffmpeg::frame::Video::empty();

        loop {
            if state.decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                state
                    .scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                return frame_from_rgb(&rgb_frame).map(Some);
            }
            if state.flushed {
                return Ok(None);
            }
            match state.next_packet() {
                Some(packet) => state
                    .decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?,
                None => {
                    state.decoder.send_eof().context("flush ffmpeg decoder")?;
                    state.flushed = true;
                }
            }
        }
    }

    fn close(&mut self) {
        self.state = None;
    }
}

impl DecodeState {
    fn next_packet(&mut self) -> Option<ffmpeg::Packet> {
        for (stream, packet) in self.input.packets() {
            if stream.index() == self.stream_index {
                return Some(packet);
            }
        }
        None
    }
}

fn frame_from_rgb(frame: &ffmpeg::frame::Video) -> Result<Frame> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("ffmpeg frame row is out of bounds")?,
            );
        }
        pixels
    };

    Frame::new(pixels, width, height, PixelFormat::Rgb24)
}
