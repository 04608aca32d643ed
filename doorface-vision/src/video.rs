use anyhow::{Context, Result};
use image::RgbImage;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::FrameSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    Rgb3,
    Yuyv,
    Grey,
    Other(FourCC),
}

impl From<FourCC> for PixelFormat {
    fn from(fourcc: FourCC) -> Self {
        match &fourcc.repr {
            b"RGB3" => Self::Rgb3,
            b"YUYV" => Self::Yuyv,
            b"GREY" => Self::Grey,
            _ => Self::Other(fourcc),
        }
    }
}

/// V4L2 capture device producing RGB frames.
pub struct Camera {
    stream: Stream<'static>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Camera {
    pub fn open(device: &str) -> Result<Self> {
        let dev = Device::with_path(device).with_context(|| format!("open camera {device}"))?;
        let mut fmt = dev.format().context("get format")?;
        // Prefer RGB, fallback to YUYV, else accept existing format
        for fourcc in [b"RGB3", b"YUYV"] {
            let desired = Format::new(fmt.width, fmt.height, FourCC::new(fourcc));
            fmt = dev.set_format(&desired).unwrap_or(fmt);
            if fmt.fourcc == FourCC::new(fourcc) {
                break;
            }
        }
        let stream = Stream::with_buffers(&dev, Type::VideoCapture, 4).context("stream")?;
        log::info!(
            "camera {} streaming {}x{} {:?}",
            device,
            fmt.width,
            fmt.height,
            fmt.fourcc
        );
        Ok(Self {
            stream,
            width: fmt.width,
            height: fmt.height,
            format: fmt.fourcc.into(),
        })
    }
}

impl FrameSource for Camera {
    fn read(&mut self) -> Result<RgbImage> {
        let (data, meta) = self.stream.next().context("capture frame")?;
        log::trace!("captured frame seq={} len={}", meta.sequence, data.len());

        let pixels = (self.width * self.height) as usize;
        let buf = match self.format {
            PixelFormat::Rgb3 => data.get(..pixels * 3).map(<[u8]>::to_vec),
            PixelFormat::Yuyv => yuyv_to_rgb(data, pixels),
            PixelFormat::Grey => data
                .get(..pixels)
                .map(|grey| grey.iter().flat_map(|&y| [y, y, y]).collect()),
            PixelFormat::Other(fourcc) => {
                anyhow::bail!("unsupported pixel format {:?}", fourcc)
            }
        }
        .ok_or_else(|| {
            anyhow::anyhow!(
                "short {:?} buffer: {} bytes for {}x{}",
                self.format,
                data.len(),
                self.width,
                self.height
            )
        })?;

        RgbImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| anyhow::anyhow!("failed to build image buffer"))
    }
}

fn yuyv_to_rgb(data: &[u8], pixels: usize) -> Option<Vec<u8>> {
    let data = data.get(..pixels * 2)?;
    let mut out = Vec::with_capacity(pixels * 3);
    for chunk in data.chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0] as f32, chunk[2] as f32] {
            out.push(clamp(y + 1.402 * v));
            out.push(clamp(y - 0.344136 * u - 0.714136 * v));
            out.push(clamp(y + 1.772 * u));
        }
    }
    Some(out)
}

fn clamp(v: f32) -> u8 {
    v.clamp(0.0, 255.0) as u8
}
