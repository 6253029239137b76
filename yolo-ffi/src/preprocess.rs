//! Image loading and conversion to network input.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

use crate::error::Result;

/// Reads any supported image file as 8-bit RGB.
pub fn imread<P: AsRef<Path>>(path: P) -> Result<RgbImage> {
    Ok(image::open(path)?.to_rgb8())
}

/// Bilinear resize to exactly `width` x `height`.
pub fn resize(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    if img.dimensions() == (width, height) {
        return img.clone();
    }
    imageops::resize(img, width, height, FilterType::Triangle)
}

/// HWC `u8` pixels to a `[1, 3, H, W]` tensor scaled to `[0, 1]`.
pub fn to_tensor(img: &RgbImage) -> Array4<f32> {
    let (w, h) = img.dimensions();
    Array4::from_shape_fn((1, 3, h as usize, w as usize), |(_, c, y, x)| {
        img.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn tensor_is_channel_first_and_normalised() {
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(2, 1, Rgb([255, 0, 51]));
        let t = to_tensor(&img);
        assert_eq!(t.shape(), &[1, 3, 2, 3]);
        assert_eq!(t[[0, 0, 1, 2]], 1.0);
        assert_eq!(t[[0, 1, 1, 2]], 0.0);
        assert!((t[[0, 2, 1, 2]] - 0.2).abs() < 1e-6);
        assert_eq!(t[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn resize_to_target() {
        let img = RgbImage::from_pixel(40, 30, Rgb([10, 20, 30]));
        let out = resize(&img, 64, 64);
        assert_eq!(out.dimensions(), (64, 64));
        assert_eq!(out.get_pixel(32, 32), &Rgb([10, 20, 30]));
    }

    #[test]
    fn imread_missing_file() {
        assert!(imread("/no/such/frame.jpg").is_err());
    }
}
