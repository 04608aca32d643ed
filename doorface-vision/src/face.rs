use image::{imageops, GrayImage, RgbImage};

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
}

impl FaceRegion {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Clamp to a `frame_w` x `frame_h` frame, returning `(x, y, w, h)` in
    /// whole pixels, or `None` when nothing of the box is inside the frame.
    pub fn clamp_to(&self, frame_w: u32, frame_h: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).min(frame_w as f32)).ceil().max(0.0) as u32;
        let y1 = ((self.y + self.height).min(frame_h as f32)).ceil().max(0.0) as u32;
        if x1 <= x0 || y1 <= y0 || x0 >= frame_w || y0 >= frame_h {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Cut the region out of the frame as a grayscale template.
pub fn crop_template(frame: &RgbImage, region: &FaceRegion) -> Option<GrayImage> {
    let (x, y, w, h) = region.clamp_to(frame.width(), frame.height())?;
    let face = imageops::crop_imm(frame, x, y, w, h).to_image();
    Some(imageops::grayscale(&face))
}

/// Apply non-maximum suppression to remove overlapping detections
pub fn nms(regions: &[FaceRegion], iou_threshold: f32) -> Vec<FaceRegion> {
    let mut sorted = regions.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<FaceRegion> = Vec::with_capacity(sorted.len());
    for candidate in sorted {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    inter / (a.area() + b.area() - inter)
}
