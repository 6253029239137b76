//! Box annotation.

use image::{Rgb, RgbImage};

use crate::postprocess::Detection;

pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const THICKNESS: u32 = 2;

/// Draws the outline of an `xyxy` box, `thickness` pixels wide on the
/// inside of the box. Coordinates outside the image are clipped.
pub fn draw_box(img: &mut RgbImage, bbox: [f32; 4], color: Rgb<u8>, thickness: u32) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 || thickness == 0 {
        return;
    }
    let px = |v: f32, max: u32| v.round().clamp(0.0, (max - 1) as f32) as u32;
    let (ax, bx) = (px(bbox[0], w), px(bbox[2], w));
    let (ay, by) = (px(bbox[1], h), px(bbox[3], h));
    let (x1, x2) = (ax.min(bx), ax.max(bx));
    let (y1, y2) = (ay.min(by), ay.max(by));

    for y in y1..=y2 {
        let edge_row = y - y1 < thickness || y2 - y < thickness;
        for x in x1..=x2 {
            if edge_row || x - x1 < thickness || x2 - x < thickness {
                img.put_pixel(x, y, color);
            }
        }
    }
}

pub fn draw_detections(img: &mut RgbImage, detections: &[Detection]) {
    for det in detections {
        draw_box(img, det.bbox, GREEN, THICKNESS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outline_only() {
        let mut img = RgbImage::new(20, 20);
        draw_box(&mut img, [2.0, 2.0, 12.0, 12.0], GREEN, 2);
        assert_eq!(img.get_pixel(2, 2), &GREEN);
        assert_eq!(img.get_pixel(3, 7), &GREEN);
        assert_eq!(img.get_pixel(12, 12), &GREEN);
        assert_eq!(img.get_pixel(11, 7), &GREEN);
        assert_eq!(img.get_pixel(7, 7), &Rgb([0, 0, 0]));
        assert_eq!(img.get_pixel(4, 4), &Rgb([0, 0, 0]));
        assert_eq!(img.get_pixel(13, 13), &Rgb([0, 0, 0]));
    }

    #[test]
    fn clipped_to_image() {
        let mut img = RgbImage::new(10, 10);
        draw_box(&mut img, [-5.0, -5.0, 50.0, 4.0], GREEN, 2);
        assert_eq!(img.get_pixel(0, 0), &GREEN);
        assert_eq!(img.get_pixel(9, 4), &GREEN);
        assert_eq!(img.get_pixel(5, 2), &Rgb([0, 0, 0]));
        assert_eq!(img.get_pixel(5, 6), &Rgb([0, 0, 0]));
    }

    #[test]
    fn detections_are_drawn_green() {
        let mut img = RgbImage::new(8, 8);
        let det = Detection {
            bbox: [1.0, 1.0, 6.0, 6.0],
            confidence: 0.9,
            class_id: 0,
            label: "person".into(),
        };
        draw_detections(&mut img, &[det]);
        assert_eq!(img.get_pixel(1, 1), &GREEN);
        assert_eq!(img.get_pixel(6, 3), &GREEN);
    }
}
