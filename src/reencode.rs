//! Native decode/encode for web image targets. Never touches the engine.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};

use crate::recipe::WebImage;

const JPEG_QUALITY: u8 = 92;

pub fn reencode(source: &[u8], target: WebImage) -> Result<Vec<u8>, image::ImageError> {
    let decoded = image::load_from_memory(source)?;
    encode(&decoded, target)
}

fn encode(image: &DynamicImage, target: WebImage) -> Result<Vec<u8>, image::ImageError> {
    let mut out = Cursor::new(Vec::new());
    match target {
        // no alpha channel in jpeg, flatten first
        WebImage::Jpg | WebImage::Jpeg => {
            let rgb = image.to_rgb8();
            JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&rgb)?;
        }
        WebImage::Png => image.write_to(&mut out, ImageFormat::Png)?,
        WebImage::Webp => {
            DynamicImage::ImageRgba8(image.to_rgba8()).write_to(&mut out, ImageFormat::WebP)?
        }
    }
    Ok(out.into_inner())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    pub(crate) fn sample_png() -> Vec<u8> {
        let img = ImageBuffer::from_fn(4, 3, |x, y| Rgba([x as u8 * 60, y as u8 * 80, 128, 200]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn png_to_each_web_format() {
        let png = sample_png();
        for (target, format) in [
            (WebImage::Jpg, ImageFormat::Jpeg),
            (WebImage::Jpeg, ImageFormat::Jpeg),
            (WebImage::Png, ImageFormat::Png),
            (WebImage::Webp, ImageFormat::WebP),
        ] {
            let out = reencode(&png, target).unwrap();
            assert_eq!(image::guess_format(&out).unwrap(), format);
            let back = image::load_from_memory(&out).unwrap();
            assert_eq!((back.width(), back.height()), (4, 3));
        }
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(reencode(b"definitely not an image", WebImage::Png).is_err());
    }
}
