//! Turning raw `[4 + nc, anchors]` predictions into boxes.

use std::collections::BTreeMap;

use ndarray::ArrayView2;

/// One detected object, in pixel coordinates of the original frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// `x1, y1, x2, y2`
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: usize,
    pub label: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PostprocessConfig {
    /// Minimum class score for a candidate to be kept.
    pub conf_threshold: f32,
    /// Boxes of one class overlapping more than this are suppressed.
    pub iou_threshold: f32,
    pub max_det: usize,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.25,
            iou_threshold: 0.7,
            max_det: 300,
        }
    }
}

fn area(b: &[f32; 4]) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

/// Intersection over union of two `xyxy` boxes; zero when either is empty.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = w * h;
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        (inter / union).clamp(0.0, 1.0)
    }
}

/// Greedy class-aware non-maximum suppression. Output is sorted by
/// descending confidence and holds at most `max_det` entries.
pub fn nms(mut dets: Vec<Detection>, iou_threshold: f32, max_det: usize) -> Vec<Detection> {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut keep: Vec<Detection> = Vec::new();
    for det in dets {
        if keep.len() == max_det {
            break;
        }
        let suppressed = keep
            .iter()
            .any(|k| k.class_id == det.class_id && iou(&k.bbox, &det.bbox) > iou_threshold);
        if !suppressed {
            keep.push(det);
        }
    }
    keep
}

/// Decodes one image's predictions.
///
/// `preds` is `[4 + nc, anchors]` with `cx, cy, w, h` in network input
/// pixels followed by class scores. `scale` maps input pixels back to
/// the frame (`frame / input` per axis) and `frame` is its `(w, h)`.
pub fn decode(
    preds: ArrayView2<'_, f32>,
    names: &BTreeMap<usize, String>,
    config: &PostprocessConfig,
    scale: (f32, f32),
    frame: (u32, u32),
) -> Vec<Detection> {
    let num_classes = preds.nrows().saturating_sub(4);
    if num_classes == 0 {
        return Vec::new();
    }
    let (sx, sy) = scale;
    let (fw, fh) = (frame.0 as f32, frame.1 as f32);

    let mut candidates = Vec::new();
    for col in preds.columns() {
        let (class_id, confidence) = col
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, s)| if s > best.1 { (i, s) } else { best });
        if confidence.is_nan() || confidence < config.conf_threshold {
            continue;
        }
        let (cx, cy, w, h) = (col[0], col[1], col[2], col[3]);
        let bbox = [
            ((cx - w / 2.0) * sx).clamp(0.0, fw),
            ((cy - h / 2.0) * sy).clamp(0.0, fh),
            ((cx + w / 2.0) * sx).clamp(0.0, fw),
            ((cy + h / 2.0) * sy).clamp(0.0, fh),
        ];
        candidates.push(Detection {
            bbox,
            confidence,
            class_id,
            label: names.get(&class_id).cloned().unwrap_or_else(|| class_id.to_string()),
        });
    }
    nms(candidates, config.iou_threshold, config.max_det)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn det(bbox: [f32; 4], confidence: f32, class_id: usize) -> Detection {
        Detection {
            bbox,
            confidence,
            class_id,
            label: String::new(),
        }
    }

    #[test]
    fn iou_of_known_boxes() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert_eq!(iou(&a, &a), 1.0);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        let half = iou(&a, &[5.0, 0.0, 15.0, 10.0]);
        assert!((half - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(iou(&[1.0, 1.0, 1.0, 1.0], &[1.0, 1.0, 1.0, 1.0]), 0.0);
    }

    #[test]
    fn nms_is_class_aware() {
        let out = nms(
            vec![
                det([0.0, 0.0, 10.0, 10.0], 0.6, 0),
                det([0.0, 0.0, 10.0, 10.0], 0.9, 0),
                det([0.0, 0.0, 10.0, 10.0], 0.8, 1),
                det([50.0, 50.0, 60.0, 60.0], 0.3, 0),
            ],
            0.7,
            300,
        );
        let confs: Vec<f32> = out.iter().map(|d| d.confidence).collect();
        assert_eq!(confs, vec![0.9, 0.8, 0.3]);
    }

    #[test]
    fn nms_caps_detections() {
        let dets = (0..10)
            .map(|i| det([i as f32 * 20.0, 0.0, i as f32 * 20.0 + 10.0, 10.0], 0.5, 0))
            .collect();
        assert_eq!(nms(dets, 0.7, 3).len(), 3);
    }

    #[test]
    fn decode_scales_and_clips() {
        // two anchors, two classes
        let preds = Array2::from_shape_vec(
            (6, 2),
            vec![
                32.0, 60.0, // cx
                32.0, 60.0, // cy
                16.0, 20.0, // w
                8.0, 20.0, // h
                0.9, 0.1, // class 0
                0.2, 0.05, // class 1
            ],
        )
        .unwrap();
        let names = BTreeMap::from([(0, "person".to_string())]);
        let config = PostprocessConfig::default();
        let out = decode(preds.view(), &names, &config, (2.0, 1.0), (128, 64));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bbox, [48.0, 28.0, 80.0, 36.0]);
        assert_eq!(out[0].label, "person");
        assert_eq!(out[0].class_id, 0);
    }

    #[test]
    fn decode_clips_to_frame() {
        let preds = Array2::from_shape_vec((5, 1), vec![2.0, 62.0, 10.0, 10.0, 0.5]).unwrap();
        let config = PostprocessConfig::default();
        let out = decode(preds.view(), &BTreeMap::new(), &config, (1.0, 1.0), (64, 64));
        assert_eq!(out[0].bbox, [0.0, 57.0, 7.0, 64.0]);
        assert_eq!(out[0].label, "0");
    }
}
