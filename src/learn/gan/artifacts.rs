use crate::{error::Error, result::Result};
use anyhow::Context;
use image::{Rgb, RgbImage};
use ndarray::ArrayView4;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

/// Images per row of a grid.
pub const GRID_ROW: usize = 8;
/// Pixels between the images of a grid.
pub const GRID_PADDING: usize = 2;

/// Arranges a batch of [B, 3, H, W] images in [-1, 1] into a grid.
///
/// Images are placed row major, [`GRID_ROW`] per row, separated and surrounded by
/// [`GRID_PADDING`] black pixels. Values are mapped with (x + 1) / 2, clamped to [0, 1] and
/// scaled to [0, 255].
pub fn image_grid(images: ArrayView4<f32>) -> Result<RgbImage> {
    let (bs, c, h, w) = images.dim();
    if c != 3 || bs == 0 {
        return Err(Error::shape_mismatch("image_grid", &[bs.max(1), 3, h, w], images.shape()).into());
    }
    let columns = GRID_ROW.min(bs);
    let rows = (bs + columns - 1) / columns;
    let cell_h = h + GRID_PADDING;
    let cell_w = w + GRID_PADDING;
    let mut grid = RgbImage::new(
        (columns * cell_w + GRID_PADDING) as u32,
        (rows * cell_h + GRID_PADDING) as u32,
    );
    for (index, image) in images.outer_iter().enumerate() {
        let y0 = (index / columns) * cell_h + GRID_PADDING;
        let x0 = (index % columns) * cell_w + GRID_PADDING;
        for y in 0..h {
            for x in 0..w {
                let pixel = [0, 1, 2].map(|c| to_u8(image[(c, y, x)]));
                grid.put_pixel((x0 + x) as u32, (y0 + y) as u32, Rgb(pixel));
            }
        }
    }
    Ok(grid)
}

fn to_u8(x: f32) -> u8 {
    let x = ((x + 1.) / 2.).clamp(0., 1.);
    (x * 255. + 0.5).min(255.) as u8
}

/// Saves a grid of images, see [`image_grid()`].
///
/// The format is determined by the extension of `path`.
pub fn save_image_grid(images: ArrayView4<f32>, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    image_grid(images)?
        .save(path)
        .with_context(|| format!("failed to save {path:?}"))
}

/// Saved model.
///
/// A model saved with [bincode](https://docs.rs/bincode), including parameters and
/// normalization statistics. Gradients and optimizer state are not saved.
///```no_run
/// # use dcgan::{learn::gan::{artifacts::SavedModel, Generator}, result::Result};
/// # fn main() -> Result<()> {
/// # let generator: Generator = todo!();
/// let path = SavedModel::new(&generator).save("generator")?;
/// assert_eq!(path.to_str(), Some("generator.model"));
/// let generator: Generator = SavedModel::load("generator")?.into_model();
/// # Ok(())
/// # }
///```
#[derive(Clone, Debug)]
pub struct SavedModel<L> {
    model: L,
}

impl<L> SavedModel<L> {
    /// Wraps `model` for saving.
    pub fn new(model: L) -> Self {
        Self { model }
    }
    /// Borrows the model.
    pub fn model(&self) -> &L {
        &self.model
    }
    /// Unwraps the model.
    pub fn into_model(self) -> L {
        self.model
    }
    /// Saves the model to `name` with the extension ".model", overwriting an existing file.
    ///
    /// Returns the path of the file.
    pub fn save(&self, name: impl AsRef<Path>) -> Result<PathBuf>
    where
        L: Serialize,
    {
        let path = name.as_ref().with_extension("model");
        let file = File::create(&path).with_context(|| format!("failed to create {path:?}"))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &self.model)
            .with_context(|| format!("failed to serialize {path:?}"))?;
        writer.flush()?;
        Ok(path)
    }
    /// Loads a model saved with [`.save()`](Self::save).
    pub fn load(name: impl AsRef<Path>) -> Result<Self>
    where
        L: DeserializeOwned,
    {
        let path = name.as_ref().with_extension("model");
        let file = File::open(&path).with_context(|| format!("failed to open {path:?}"))?;
        let model = bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("failed to deserialize {path:?}"))?;
        Ok(Self { model })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn grid_layout() -> Result<()> {
        let images = Array::from_shape_fn([10, 3, 4, 4], |(b, _, _, _)| {
            if b == 9 {
                1.
            } else {
                -1.
            }
        });
        let grid = image_grid(images.view())?;
        // 8 columns, 2 rows.
        assert_eq!(grid.dimensions(), (8 * 6 + 2, 2 * 6 + 2));
        // Image 9 is the second of the second row.
        assert_eq!(grid.get_pixel(6 + 2, 6 + 2), &Rgb([255, 255, 255]));
        assert_eq!(grid.get_pixel(2, 2), &Rgb([0, 0, 0]));
        assert_eq!(grid.get_pixel(0, 0), &Rgb([0, 0, 0]));
        Ok(())
    }

    #[test]
    fn grid_denormalizes() -> Result<()> {
        let images = Array::from_shape_vec([1, 3, 1, 1], vec![0., 2., -3.])?;
        let grid = image_grid(images.view())?;
        assert_eq!(grid.dimensions(), (5, 5));
        assert_eq!(grid.get_pixel(2, 2), &Rgb([128, 255, 0]));
        Ok(())
    }

    #[test]
    fn grid_requires_rgb() {
        let images = Array::<f32, _>::zeros([2, 1, 4, 4]);
        assert!(image_grid(images.view()).is_err());
    }

    #[test]
    fn saved_model_extension() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = SavedModel::new(vec![1f32, 2.]).save(dir.path().join("weights"))?;
        assert_eq!(path, dir.path().join("weights.model"));
        let loaded: Vec<f32> = SavedModel::load(dir.path().join("weights"))?.into_model();
        assert_eq!(loaded, [1., 2.]);
        assert!(SavedModel::<Vec<f32>>::load(dir.path().join("missing")).is_err());
        Ok(())
    }
}
