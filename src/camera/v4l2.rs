use crate::common::config::CameraConfig;
use crate::common::{GateError, Result};
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, Rgb};
use std::fs;
use std::thread;
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

const STREAM_BUFFERS: u32 = 4;

#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub index: u32,
    pub card: String,
    pub formats: Vec<String>,
}

/// A V4L2 capture device configured for the gate's frame stream.
pub struct Camera {
    device: Device,
    config: CameraConfig,
    format: v4l::Format,
}

/// A running mmap stream. Frames come out in the negotiated pixel format.
pub struct CameraSession<'a> {
    stream: v4l::io::mmap::Stream<'a>,
    format: v4l::Format,
}

fn fourcc_name(fourcc: &FourCC) -> &str {
    fourcc.str().unwrap_or("????")
}

impl Camera {
    pub fn new(config: &CameraConfig) -> Result<Self> {
        let index = config.device_index;
        let device = Device::new(index as usize)
            .map_err(|e| GateError::Camera(format!("Failed to open camera {}: {}", index, e)))?;

        let caps = device
            .query_caps()
            .map_err(|e| GateError::Camera(format!("Failed to query capabilities: {}", e)))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            tracing::warn!("Device {} ({}) does not advertise video capture", index, caps.card);
        }

        let mut fmt = device
            .format()
            .map_err(|e| GateError::Camera(format!("Failed to get format: {}", e)))?;
        tracing::debug!("Current format: {}x{} {}", fmt.width, fmt.height, fourcc_name(&fmt.fourcc));

        fmt.width = config.width;
        fmt.height = config.height;
        if fourcc_name(&fmt.fourcc) != "GREY" {
            fmt.fourcc = FourCC::new(b"MJPG");
        }

        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("Could not set exact format: {}. Using device defaults.", e);
        }

        let format = device
            .format()
            .map_err(|e| GateError::Camera(format!("Failed to get final format: {}", e)))?;
        if format.width != config.width || format.height != config.height {
            tracing::warn!(
                "Camera resolution {}x{} differs from requested {}x{}",
                format.width,
                format.height,
                config.width,
                config.height
            );
        }
        tracing::info!(
            "Camera {} ({}) streaming {}x{} {}",
            index,
            caps.card,
            format.width,
            format.height,
            fourcc_name(&format.fourcc)
        );

        Ok(Self { device, config: config.clone(), format })
    }

    /// Every `/dev/videoN` node that answers a capability query.
    pub fn list_cameras() -> Result<Vec<CameraInfo>> {
        let mut cameras = Vec::new();

        for entry in fs::read_dir("/dev")? {
            let path = entry?.path();
            let Some(index) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("video"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let Ok(device) = Device::new(index as usize) else { continue };
            let Ok(caps) = device.query_caps() else { continue };
            let formats = device
                .enum_formats()
                .unwrap_or_default()
                .iter()
                .map(|f| fourcc_name(&f.fourcc).to_string())
                .collect();

            cameras.push(CameraInfo { index, card: caps.card.clone(), formats });
        }

        cameras.sort_by_key(|c| c.index);
        Ok(cameras)
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.format.width, self.format.height)
    }

    pub fn start_session(&mut self) -> Result<CameraSession<'_>> {
        let mut stream = v4l::io::mmap::Stream::with_buffers(&mut self.device, Type::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| GateError::Camera(format!("Failed to create stream: {}", e)))?;

        tracing::debug!("Warming up camera ({} frames)", self.config.warmup_frames);
        for i in 0..self.config.warmup_frames {
            stream
                .next()
                .map_err(|e| GateError::Camera(format!("Failed to capture warmup frame {}: {}", i, e)))?;
            thread::sleep(Duration::from_millis(self.config.warmup_delay_ms));
        }

        Ok(CameraSession { stream, format: self.format.clone() })
    }
}

impl CameraSession<'_> {
    pub fn capture_frame(&mut self) -> Result<DynamicImage> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| GateError::Camera(format!("Failed to capture: {}", e)))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };

        decode_frame(fourcc_name(&self.format.fourcc), data, self.format.width, self.format.height)
    }
}

pub fn decode_frame(fourcc: &str, data: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    match fourcc {
        "GREY" => {
            let pixels = data.get(..(width * height) as usize).unwrap_or(data).to_vec();
            ImageBuffer::<Luma<u8>, _>::from_raw(width, height, pixels)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| GateError::Camera("Short grayscale frame".into()))
        }
        "MJPG" => Ok(image::load_from_memory_with_format(data, ImageFormat::Jpeg)?),
        "YUYV" => yuyv_to_rgb(data, width, height),
        other => Err(GateError::Camera(format!("Unsupported pixel format {}", other))),
    }
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    let expected = (width * height * 2) as usize;
    if data.len() < expected {
        return Err(GateError::Camera("Short YUYV frame".into()));
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in data[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0] as f32, chunk[1] as f32 - 128.0, chunk[2] as f32, chunk[3] as f32 - 128.0);
        for y in [y0, y1] {
            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }
    }

    ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, rgb)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| GateError::Camera("Failed to build RGB frame".into()))
}
