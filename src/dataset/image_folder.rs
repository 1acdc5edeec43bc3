use super::Dataset;
use crate::{error::Error, result::Result};
use anyhow::{ensure, Context};
use image::{imageops::FilterType, ImageFormat, RgbImage};
use ndarray::{Array, Array3, Array4, Axis};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Builders.
pub mod builder {
    use super::*;

    /// Builder for creating an [`ImageFolder`].
    #[derive(Clone, Debug)]
    pub struct ImageFolderBuilder {
        path: PathBuf,
        image_size: usize,
    }

    impl ImageFolderBuilder {
        pub(super) fn new(path: PathBuf) -> Self {
            Self {
                path,
                image_size: 64,
            }
        }
        /// Height and width of the loaded images. Default is 64.
        pub fn image_size(self, image_size: usize) -> Self {
            Self { image_size, ..self }
        }
        /// Scans the directory.
        ///
        /// **Errors**
        /// - [`Error::MissingDirectory`] if the path is not a directory.
        /// - [`Error::EmptyDataset`] if no images were found.
        /// - The directory could not be read.
        pub fn build(self) -> Result<ImageFolder> {
            let Self { path, image_size } = self;
            ensure!(image_size > 0, "image_size must be positive!");
            if !path.is_dir() {
                return Err(Error::MissingDirectory(path).into());
            }
            let mut files = Vec::new();
            for entry in WalkDir::new(&path).sort_by_file_name() {
                let entry = entry.with_context(|| format!("failed to read {path:?}"))?;
                let readable = ImageFormat::from_path(entry.path())
                    .map_or(false, |format| format.reading_enabled());
                if entry.file_type().is_file() && readable {
                    files.push(entry.into_path());
                }
            }
            if files.is_empty() {
                return Err(Error::EmptyDataset(path).into());
            }
            Ok(ImageFolder {
                path,
                files,
                image_size,
            })
        }
    }
}
use builder::ImageFolderBuilder;

/// A directory of images.
///
/// Files are found recursively in sorted order and kept if their extension names an image
/// format with an enabled decoder. Images are decoded when sampled, converted to RGB, resized to
/// `image_size` x `image_size` and normalized to [-1, 1].
///
/// Items are [B, 3, image_size, image_size].
#[derive(Clone, Debug)]
pub struct ImageFolder {
    path: PathBuf,
    files: Vec<PathBuf>,
    image_size: usize,
}

impl ImageFolder {
    /// A builder for loading images from `path`.
    pub fn builder(path: impl AsRef<Path>) -> ImageFolderBuilder {
        ImageFolderBuilder::new(path.as_ref().to_path_buf())
    }
    /// The directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// The image files.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
    /// Height and width of the loaded images.
    pub fn image_size(&self) -> usize {
        self.image_size
    }
    /// Loads one image as [3, image_size, image_size].
    ///
    /// **Errors**
    /// [`Error::Image`] if the file could not be opened or decoded.
    pub fn load(&self, path: &Path) -> Result<Array3<f32>> {
        let image = image::open(path).map_err(|source| Error::Image {
            path: path.to_path_buf(),
            source,
        })?;
        let size = self.image_size as u32;
        let mut rgb = image.into_rgb8();
        if rgb.dimensions() != (size, size) {
            rgb = image::imageops::resize(&rgb, size, size, FilterType::Triangle);
        }
        Ok(normalize(&rgb))
    }
}

/// [H, W] RGB8 => [3, H, W] in [-1, 1].
fn normalize(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array::from_shape_fn(
        [3, height as usize, width as usize],
        |(c, y, x)| {
            let value = image.get_pixel(x as u32, y as u32)[c] as f32 / 255.;
            (value - 0.5) / 0.5
        },
    )
}

impl Dataset for ImageFolder {
    type Item = Array4<f32>;
    fn sample_count(&self) -> usize {
        self.files.len()
    }
    fn sample(&self, indices: &[usize]) -> Result<Self::Item> {
        let images = indices
            .par_iter()
            .map(|index| {
                let path = self.files.get(*index).with_context(|| {
                    format!("Index {index} out of bounds for {} images!", self.files.len())
                })?;
                self.load(path)
            })
            .collect::<Result<Vec<_>>>()?;
        let size = self.image_size;
        let mut batch = Array4::zeros([images.len(), 3, size, size]);
        for (mut output, image) in batch.axis_iter_mut(Axis(0)).zip(images) {
            output.assign(&image);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::fs;

    fn write_images(dir: &Path, count: usize, size: u32) -> Result<()> {
        for i in 0..count {
            let image = RgbImage::from_fn(size, size, |x, y| {
                Rgb([(i * 20) as u8, (x * 10) as u8, (y * 10) as u8])
            });
            image.save(dir.join(format!("{i:03}.png")))?;
        }
        Ok(())
    }

    #[test]
    fn loads_and_normalizes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(dir.path(), 3, 16)?;
        fs::write(dir.path().join("notes.txt"), "not an image")?;
        let dataset = ImageFolder::builder(dir.path()).image_size(8).build()?;
        assert_eq!(dataset.sample_count(), 3);
        let batch = dataset.sample(&[2, 0])?;
        assert_eq!(batch.dim(), (2, 3, 8, 8));
        assert!(batch.iter().all(|x| (-1. ..=1.).contains(x)));
        // The red channel is constant, 40 for image 2 and 0 for image 0.
        let red = 40. / 255. * 2. - 1.;
        assert!((batch[(0, 0, 3, 3)] - red).abs() < 1e-5);
        assert_eq!(batch[(1, 0, 3, 3)], -1.);
        Ok(())
    }

    #[test]
    fn skips_formats_without_decoder() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(dir.path(), 3, 8)?;
        fs::write(
            dir.path().join("z.gif"),
            b"GIF89a\x01\x00\x01\x00\x00\x00\x00;",
        )?;
        fs::write(dir.path().join("y.tiff"), b"II*\x00")?;
        let dataset = ImageFolder::builder(dir.path()).image_size(8).build()?;
        assert_eq!(dataset.sample_count(), 3);
        let batch = dataset.sample(&[0, 1, 2])?;
        assert_eq!(batch.dim(), (3, 3, 8, 8));
        Ok(())
    }

    #[test]
    fn scans_recursively_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;
        write_images(dir.path(), 2, 8)?;
        write_images(&nested, 1, 8)?;
        let dataset = ImageFolder::builder(dir.path()).image_size(8).build()?;
        let names: Vec<_> = dataset
            .files()
            .iter()
            .map(|path| path.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            [
                PathBuf::from("000.png"),
                PathBuf::from("001.png"),
                PathBuf::from("nested/000.png")
            ]
        );
        Ok(())
    }

    #[test]
    fn missing_directory() {
        let error = ImageFolder::builder("does/not/exist").build().unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::MissingDirectory(_))
        ));
    }

    #[test]
    fn empty_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let error = ImageFolder::builder(dir.path()).build().unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::EmptyDataset(_))
        ));
        Ok(())
    }

    #[test]
    fn corrupt_image_names_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.png");
        fs::write(&path, b"not a png")?;
        let dataset = ImageFolder::builder(dir.path()).image_size(8).build()?;
        let error = dataset.sample(&[0]).unwrap_err();
        match error.downcast_ref::<Error>() {
            Some(Error::Image { path: error_path, .. }) => assert_eq!(error_path, &path),
            _ => panic!("expected an image error, found {error:?}"),
        }
        Ok(())
    }
}
