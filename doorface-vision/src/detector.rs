//! YuNet face detector.
//!
//! The 2023mar model takes a `[1, 3, 640, 640]` BGR tensor and produces twelve
//! outputs, four per stride (8, 16, 32) in the order
//! `cls_*`, `obj_*`, `bbox_*`, `kps_*`. Each grid cell predicts a box centre
//! offset in stride units and a log-scale width/height.

use std::path::Path;

use anyhow::{Context, Result};
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::{session::Session, value::Tensor};

use crate::face::{self, FaceRegion};
use crate::FaceDetector;

const INPUT_SIZE: u32 = 640;
const STRIDES: [usize; 3] = [8, 16, 32];

pub struct YunetDetector {
    session: Session,
    score_threshold: f32,
    nms_threshold: f32,
}

/// Placement of the source frame inside the square network input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    offset_x: f32,
    offset_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = INPUT_SIZE as f32 / width.max(height) as f32;
        let new_w = (width as f32 * scale) as u32;
        let new_h = (height as f32 * scale) as u32;
        Self {
            scale,
            offset_x: (INPUT_SIZE.saturating_sub(new_w) / 2) as f32,
            offset_y: (INPUT_SIZE.saturating_sub(new_h) / 2) as f32,
        }
    }

    fn to_frame(&self, region: FaceRegion) -> FaceRegion {
        FaceRegion {
            x: (region.x - self.offset_x) / self.scale,
            y: (region.y - self.offset_y) / self.scale,
            width: region.width / self.scale,
            height: region.height / self.scale,
            score: region.score,
        }
    }
}

impl YunetDetector {
    pub fn open(model: &Path, score_threshold: f32, nms_threshold: f32) -> Result<Self> {
        Ok(Self {
            session: crate::model::detector_session(model)?,
            score_threshold,
            nms_threshold,
        })
    }

    fn input_tensor(frame: &RgbImage, letterbox: &Letterbox) -> Result<Tensor<f32>> {
        let new_w = (frame.width() as f32 * letterbox.scale) as u32;
        let new_h = (frame.height() as f32 * letterbox.scale) as u32;
        let resized = imageops::resize(frame, new_w, new_h, imageops::FilterType::Triangle);

        let mut canvas = RgbImage::new(INPUT_SIZE, INPUT_SIZE);
        imageops::overlay(
            &mut canvas,
            &resized,
            letterbox.offset_x as i64,
            letterbox.offset_y as i64,
        );

        // CHW, BGR channel order, raw 0..255 values
        let side = INPUT_SIZE as usize;
        let plane = side * side;
        let mut data = vec![0.0f32; 3 * plane];
        for (i, px) in canvas.pixels().enumerate() {
            data[i] = px[2] as f32;
            data[plane + i] = px[1] as f32;
            data[2 * plane + i] = px[0] as f32;
        }

        let array = Array4::from_shape_vec((1, 3, side, side), data)?;
        Ok(Tensor::from_array(array)?)
    }
}

impl FaceDetector for YunetDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceRegion>> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(vec![]);
        }
        let letterbox = Letterbox::fit(frame.width(), frame.height());
        let input = Self::input_tensor(frame, &letterbox)?;

        let tensors = {
            let outputs = self
                .session
                .run(ort::inputs![input])
                .context("running detector")?;

            let mut tensors: Vec<Vec<f32>> = Vec::with_capacity(12);
            for (_name, output) in outputs.iter() {
                let (_shape, data) = output.try_extract_tensor::<f32>()?;
                tensors.push(data.to_vec());
            }
            tensors
        };

        let regions = decode(&tensors, INPUT_SIZE as usize, self.score_threshold)?
            .into_iter()
            .map(|r| letterbox.to_frame(r))
            .collect::<Vec<_>>();

        log::debug!("detector produced {} candidate face(s)", regions.len());
        Ok(face::nms(&regions, self.nms_threshold))
    }
}

/// Decode the twelve raw YuNet outputs into regions in network-input pixels.
fn decode(tensors: &[Vec<f32>], input_size: usize, score_threshold: f32) -> Result<Vec<FaceRegion>> {
    if tensors.len() < 12 {
        anyhow::bail!("expected 12 detector outputs, got {}", tensors.len());
    }

    let mut regions = Vec::new();
    for (scale_idx, &stride) in STRIDES.iter().enumerate() {
        let cols = input_size / stride;
        let cells = cols * cols;
        let cls = &tensors[scale_idx];
        let obj = &tensors[scale_idx + 3];
        let bbox = &tensors[scale_idx + 6];

        if cls.len() != cells || obj.len() != cells || bbox.len() != cells * 4 {
            anyhow::bail!(
                "unexpected detector output size for stride {}: cls={} obj={} bbox={}",
                stride,
                cls.len(),
                obj.len(),
                bbox.len()
            );
        }

        for idx in 0..cells {
            let score = (cls[idx].clamp(0.0, 1.0) * obj[idx].clamp(0.0, 1.0)).sqrt();
            if score < score_threshold {
                continue;
            }
            let row = (idx / cols) as f32;
            let col = (idx % cols) as f32;
            let s = stride as f32;

            let cx = (col + bbox[idx * 4]) * s;
            let cy = (row + bbox[idx * 4 + 1]) * s;
            let w = bbox[idx * 4 + 2].exp() * s;
            let h = bbox[idx * 4 + 3].exp() * s;

            regions.push(FaceRegion {
                x: cx - w / 2.0,
                y: cy - h / 2.0,
                width: w,
                height: h,
                score,
            });
        }
    }

    Ok(regions)
}
