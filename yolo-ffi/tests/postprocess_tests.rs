use proptest::prelude::*;
use yolo_ffi::postprocess::{iou, nms, Detection};

fn bbox() -> impl Strategy<Value = [f32; 4]> {
    (0.0f32..500.0, 0.0f32..500.0, 0.0f32..200.0, 0.0f32..200.0)
        .prop_map(|(x, y, w, h)| [x, y, x + w, y + h])
}

fn detection() -> impl Strategy<Value = Detection> {
    (bbox(), 0.0f32..1.0, 0usize..3).prop_map(|(bbox, confidence, class_id)| Detection {
        bbox,
        confidence,
        class_id,
        label: class_id.to_string(),
    })
}

proptest! {
    #[test]
    fn iou_is_symmetric_and_bounded(a in bbox(), b in bbox()) {
        let ab = iou(&a, &b);
        prop_assert!((0.0..=1.0).contains(&ab));
        prop_assert!((ab - iou(&b, &a)).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_no_overlapping_pair(
        dets in prop::collection::vec(detection(), 0..40),
        max_det in 1usize..50,
    ) {
        let kept = nms(dets.clone(), 0.5, max_det);
        prop_assert!(kept.len() <= max_det.min(dets.len()));
        prop_assert!(kept.windows(2).all(|w| w[0].confidence >= w[1].confidence));
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                prop_assert!(a.class_id != b.class_id || iou(&a.bbox, &b.bbox) <= 0.5);
            }
        }
        if let Some(best) = dets.iter().map(|d| d.confidence).reduce(f32::max) {
            prop_assert_eq!(kept[0].confidence, best);
        }
    }
}
