//! Local binary pattern histogram face classifier.
//!
//! Every template is normalised to a fixed square, turned into a map of 8-bit
//! local binary patterns, and summarised as per-cell histograms over a grid.
//! Prediction is nearest neighbour under the chi-square distance, so an exact
//! copy of a training template scores 0 and unrelated faces land well above
//! the usual acceptance threshold of 70.

use anyhow::Result;
use image::{imageops, GrayImage};

use crate::{FaceClassifier, Label, Prediction};

const TEMPLATE_SIZE: u32 = 100;
const GRID: usize = 8;
const BINS: usize = 256;

// Clockwise from top-left.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

#[derive(Debug, Default)]
pub struct LbphClassifier {
    samples: Vec<(Vec<f32>, Label)>,
}

impl LbphClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl FaceClassifier for LbphClassifier {
    fn train(&mut self, samples: &[(GrayImage, Label)]) -> Result<()> {
        self.samples = samples
            .iter()
            .map(|(template, label)| (spatial_histogram(template), *label))
            .collect();
        log::debug!("lbph model trained on {} template(s)", self.samples.len());
        Ok(())
    }

    fn predict(&self, template: &GrayImage) -> Result<Prediction> {
        let query = spatial_histogram(template);
        self.samples
            .iter()
            .map(|(hist, label)| Prediction {
                label: *label,
                distance: chi_square(hist, &query),
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
            .ok_or_else(|| anyhow::anyhow!("classifier has not been trained"))
    }
}

fn spatial_histogram(template: &GrayImage) -> Vec<f32> {
    let img = if template.dimensions() == (TEMPLATE_SIZE, TEMPLATE_SIZE) {
        template.clone()
    } else {
        imageops::resize(
            template,
            TEMPLATE_SIZE,
            TEMPLATE_SIZE,
            imageops::FilterType::Triangle,
        )
    };

    // Border pixels have no full neighbourhood.
    let side = TEMPLATE_SIZE as usize - 2;
    let mut hist = vec![0.0f32; GRID * GRID * BINS];
    let mut counts = [0u32; GRID * GRID];

    for y in 0..side {
        for x in 0..side {
            let (px, py) = (x as i32 + 1, y as i32 + 1);
            let centre = img.get_pixel(px as u32, py as u32)[0];
            let mut code = 0usize;
            for (bit, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
                let v = img.get_pixel((px + dx) as u32, (py + dy) as u32)[0];
                if v >= centre {
                    code |= 1 << (7 - bit);
                }
            }
            let cell = (y * GRID / side) * GRID + x * GRID / side;
            hist[cell * BINS + code] += 1.0;
            counts[cell] += 1;
        }
    }

    for (cell, &count) in counts.iter().enumerate() {
        if count > 0 {
            for bin in &mut hist[cell * BINS..(cell + 1) * BINS] {
                *bin /= count as f32;
            }
        }
    }
    hist
}

fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let sum = x as f64 + y as f64;
            if sum > 0.0 {
                let diff = x as f64 - y as f64;
                2.0 * diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stripes(period: u32) -> GrayImage {
        GrayImage::from_fn(120, 120, |x, _| {
            image::Luma([if (x / period) % 2 == 0 { 30 } else { 220 }])
        })
    }

    fn bands(period: u32) -> GrayImage {
        GrayImage::from_fn(120, 120, |_, y| {
            image::Luma([if (y / period) % 2 == 0 { 30 } else { 220 }])
        })
    }

    fn checker(period: u32) -> GrayImage {
        GrayImage::from_fn(120, 120, |x, y| {
            image::Luma([if ((x / period) + (y / period)) % 2 == 0 { 10 } else { 240 }])
        })
    }

    #[test]
    fn untrained_model_cannot_predict() {
        let model = LbphClassifier::new();
        assert!(model.predict(&stripes(4)).is_err());
    }

    #[test]
    fn identical_template_has_zero_distance() {
        let mut model = LbphClassifier::new();
        model
            .train(&[(stripes(4), 0), (checker(6), 1)])
            .unwrap();

        let p = model.predict(&checker(6)).unwrap();
        assert_eq!(p.label, 1);
        assert!(p.distance < 1e-9);
    }

    #[test]
    fn nearest_neighbour_wins() {
        let mut model = LbphClassifier::new();
        model
            .train(&[(stripes(4), 7), (bands(6), 9)])
            .unwrap();

        let p = model.predict(&stripes(5)).unwrap();
        assert_eq!(p.label, 7);
        assert!(p.distance > 0.0);
    }

    #[test]
    fn retraining_replaces_samples() {
        let mut model = LbphClassifier::new();
        model.train(&[(stripes(4), 0), (checker(6), 1)]).unwrap();
        assert_eq!(model.len(), 2);
        model.train(&[(checker(6), 3)]).unwrap();
        assert_eq!(model.len(), 1);
        assert_eq!(model.predict(&stripes(4)).unwrap().label, 3);
    }
}
