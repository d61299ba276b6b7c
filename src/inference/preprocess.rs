use image::imageops::{self, FilterType};

use crate::error::PredictionError;

/// Resolution the vision model was trained on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Normalized RGB pixels in `(1, H, W, 3)` row-major order, values in `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct PixelGrid {
    size: ImageSize,
    data: Vec<f32>,
}

impl PixelGrid {
    pub fn shape(&self) -> [usize; 4] {
        [1, self.size.height as usize, self.size.width as usize, 3]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Decodes an uploaded image and stretches it to `size` without keeping the aspect ratio.
#[tracing::instrument(level = "debug", skip(bytes), fields(len = bytes.len()))]
pub fn preprocess(bytes: &[u8], size: ImageSize) -> Result<PixelGrid, PredictionError> {
    if bytes.is_empty() {
        return Err(PredictionError::Decode("image payload is empty".to_string()));
    }
    let decoded =
        image::load_from_memory(bytes).map_err(|e| PredictionError::Decode(e.to_string()))?;
    tracing::debug!(
        width = decoded.width(),
        height = decoded.height(),
        "decoded image"
    );

    let rgb = decoded.to_rgb8();
    let resized = imageops::resize(&rgb, size.width, size.height, FilterType::CatmullRom);
    let data = resized
        .into_raw()
        .into_iter()
        .map(|channel| f32::from(channel) / 255.0)
        .collect();

    Ok(PixelGrid { size, data })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

    /// Encodes a solid-colour image of the given dimensions.
    pub(crate) fn solid_image(width: u32, height: u32, colour: [u8; 3], format: ImageFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(colour)));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), format)
            .expect("in-memory encoding cannot fail");
        bytes
    }
}
