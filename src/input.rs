use std::path::{Path, PathBuf};

use image::{ImageBuffer, Luma, Rgb32FImage, imageops::FilterType};
use ndarray::{Array2, Array3, ArrayView2, Axis};

use crate::error::PredictorError;

#[derive(Debug, Clone, PartialEq)]
pub enum ImageInput {
    /// Path to an encoded image file.
    Path(PathBuf),
    /// Decoded `H x W x 3` float array, BGR channel order.
    Array(Array3<f32>),
}

impl From<PathBuf> for ImageInput {
    fn from(value: PathBuf) -> Self {
        ImageInput::Path(value)
    }
}

impl From<&Path> for ImageInput {
    fn from(value: &Path) -> Self {
        ImageInput::Path(value.to_path_buf())
    }
}

impl From<&str> for ImageInput {
    fn from(value: &str) -> Self {
        ImageInput::Path(PathBuf::from(value))
    }
}

impl From<Array3<f32>> for ImageInput {
    fn from(value: Array3<f32>) -> Self {
        ImageInput::Array(value)
    }
}

impl ImageInput {
    /// Decodes (or validates) the input into a BGR `f32` array.
    pub fn to_bgr_array(&self) -> Result<Array3<f32>, PredictorError> {
        match self {
            ImageInput::Path(path) => load_bgr(path),
            ImageInput::Array(array) => {
                let (h, w, c) = array.dim();
                if c != 3 {
                    return Err(PredictorError::BadInput(format!(
                        "expected a 3-channel HWC array, got shape [{h}, {w}, {c}]"
                    )));
                }
                if h == 0 || w == 0 {
                    return Err(PredictorError::BadInput("image has zero size".into()));
                }
                Ok(array.as_standard_layout().into_owned())
            }
        }
    }
}

pub fn load_bgr(path: &Path) -> Result<Array3<f32>, PredictorError> {
    if !path.is_file() {
        return Err(PredictorError::BadInput(format!(
            "image {} does not exist",
            path.display()
        )));
    }
    let rgb = image::open(path)?.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut array = Array3::<f32>::zeros((height as usize, width as usize, 3));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let (y, x) = (y as usize, x as usize);
        array[[y, x, 0]] = f32::from(b);
        array[[y, x, 1]] = f32::from(g);
        array[[y, x, 2]] = f32::from(r);
    }
    Ok(array)
}

/// Reverses the channel axis (BGR <-> RGB).
pub fn swap_channels(array: &mut Array3<f32>) {
    array.invert_axis(Axis(2));
    let owned = array.as_standard_layout().into_owned();
    *array = owned;
}

pub fn resize(array: &Array3<f32>, height: usize, width: usize, filter: FilterType) -> Array3<f32> {
    let (h, w, _) = array.dim();
    if h == height && w == width {
        return array.clone();
    }
    let mut data: Vec<f32> = array.iter().copied().collect();
    let range = to_unit_range(&mut data);
    // Dimensions come from an existing array, so the buffer always fits.
    let Some(buffer) = Rgb32FImage::from_raw(w as u32, h as u32, data) else {
        return Array3::zeros((height, width, 3));
    };
    let mut resized = image::imageops::resize(&buffer, width as u32, height as u32, filter).into_raw();
    from_unit_range(&mut resized, range);
    Array3::from_shape_vec((height, width, 3), resized)
        .unwrap_or_else(|_| Array3::zeros((height, width, 3)))
}

/// Resizes a single-channel plane, used for label, score and mask maps.
pub fn resize_plane(
    plane: ArrayView2<'_, f32>,
    height: usize,
    width: usize,
    filter: FilterType,
) -> Array2<f32> {
    let (h, w) = plane.dim();
    if h == height && w == width {
        return plane.to_owned();
    }
    let mut data: Vec<f32> = plane.iter().copied().collect();
    let range = to_unit_range(&mut data);
    let Some(buffer) = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(w as u32, h as u32, data)
    else {
        return Array2::zeros((height, width));
    };
    let mut resized = image::imageops::resize(&buffer, width as u32, height as u32, filter).into_raw();
    from_unit_range(&mut resized, range);
    Array2::from_shape_vec((height, width), resized)
        .unwrap_or_else(|_| Array2::zeros((height, width)))
}

/// `image` clamps float samples to `[0, 1]` while resampling, so values are
/// mapped into that range first. Returns `(offset, span)`.
fn to_unit_range(data: &mut [f32]) -> (f32, f32) {
    let lo = data.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !lo.is_finite() || !hi.is_finite() || hi <= lo {
        let offset = if lo.is_finite() { lo } else { 0.0 };
        data.iter_mut().for_each(|v| *v = 0.0);
        return (offset, 0.0);
    }
    let span = hi - lo;
    data.iter_mut().for_each(|v| *v = (*v - lo) / span);
    (lo, span)
}

fn from_unit_range(data: &mut [f32], (offset, span): (f32, f32)) {
    data.iter_mut().for_each(|v| *v = *v * span + offset);
}

#[cfg(test)]
mod tests {
    use image::Rgb;
    use ndarray::array;

    use super::*;

    #[test]
    fn decodes_files_as_bgr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        image::RgbImage::from_pixel(4, 2, Rgb([255, 10, 0]))
            .save(&path)
            .unwrap();

        let array = ImageInput::from(path.as_path()).to_bgr_array().unwrap();
        assert_eq!(array.dim(), (2, 4, 3));
        assert_eq!(array[[1, 3, 0]], 0.0);
        assert_eq!(array[[1, 3, 1]], 10.0);
        assert_eq!(array[[1, 3, 2]], 255.0);
    }

    #[test]
    fn rejects_non_rgb_arrays() {
        let input = ImageInput::Array(Array3::zeros((4, 4, 1)));
        assert!(matches!(
            input.to_bgr_array(),
            Err(PredictorError::BadInput(_))
        ));
    }

    #[test]
    fn missing_file_is_bad_input() {
        let input = ImageInput::from("/definitely/not/here.jpg");
        assert!(matches!(
            input.to_bgr_array(),
            Err(PredictorError::BadInput(_))
        ));
    }

    #[test]
    fn swap_channels_reverses_last_axis() {
        let mut pixel = array![[[1.0f32, 2.0, 3.0]]];
        swap_channels(&mut pixel);
        assert_eq!(pixel, array![[[3.0f32, 2.0, 1.0]]]);
    }

    #[test]
    fn resize_changes_spatial_dims_only() {
        let input = Array3::<f32>::from_elem((4, 6, 3), 7.0);
        let out = resize(&input, 2, 3, FilterType::Triangle);
        assert_eq!(out.dim(), (2, 3, 3));
        assert!(out.iter().all(|v| (v - 7.0).abs() < 1e-4));
    }

    #[test]
    fn resize_keeps_values_outside_unit_range() {
        let mut plane = Array2::<f32>::zeros((2, 2));
        plane[[0, 0]] = -2.0;
        plane[[1, 1]] = 200.0;
        let out = resize_plane(plane.view(), 4, 4, FilterType::Nearest);
        assert_eq!(out.dim(), (4, 4));
        assert!((out[[0, 0]] + 2.0).abs() < 1e-3);
        assert!((out[[3, 3]] - 200.0).abs() < 1e-3);
    }
}
