//! Non-maximum suppression

use crate::error::VisionError;
use spotter_core::BoxXywh;

/// Intersection over union of two top-left boxes
pub fn compute_iou(a: &BoxXywh, b: &BoxXywh) -> f32 {
    if a.width <= 0 || a.height <= 0 || b.width <= 0 || b.height <= 0 {
        return 0.0;
    }

    let (ax0, ay0) = (a.x as f32, a.y as f32);
    let (ax1, ay1) = (ax0 + a.width as f32, ay0 + a.height as f32);
    let (bx0, by0) = (b.x as f32, b.y as f32);
    let (bx1, by1) = (bx0 + b.width as f32, by0 + b.height as f32);

    let inter_w = ax1.min(bx1) - ax0.max(bx0);
    let inter_h = ay1.min(by1) - ay0.max(by0);
    if inter_w <= 0.0 || inter_h <= 0.0 {
        return 0.0;
    }

    let intersection = inter_w * inter_h;
    let union = a.width as f32 * a.height as f32 + b.width as f32 * b.height as f32 - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// Greedy suppression.
///
/// Candidates not scoring above `score_threshold` are dropped; the rest are
/// visited by descending confidence and a box is kept only if its IoU with
/// every box kept so far is below `iou_threshold`. Returns the kept indices
/// in ascending (emission) order; an empty result is a normal outcome.
pub fn suppress(
    boxes: &[BoxXywh],
    confidences: &[f32],
    iou_threshold: f32,
    score_threshold: f32,
) -> Result<Vec<usize>, VisionError> {
    if boxes.len() != confidences.len() {
        return Err(VisionError::ShapeMismatch(format!(
            "{} boxes but {} confidences",
            boxes.len(),
            confidences.len()
        )));
    }

    let mut order: Vec<usize> = (0..boxes.len())
        .filter(|&i| confidences[i].is_finite() && confidences[i] > score_threshold)
        .collect();
    // stable: equal scores keep emission order
    order.sort_by(|&a, &b| {
        confidences[b]
            .partial_cmp(&confidences[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<usize> = Vec::new();
    for candidate in order {
        let overlaps = keep
            .iter()
            .any(|&kept| compute_iou(&boxes[kept], &boxes[candidate]) >= iou_threshold);
        if !overlaps {
            keep.push(candidate);
        }
    }

    keep.sort_unstable();
    Ok(keep)
}
