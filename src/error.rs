use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading data or assembling networks.
///
/// Functions return [`anyhow::Error`](crate::result::Result), these variants can be recovered with
/// [`anyhow::Error::downcast_ref`].
#[derive(Debug, Error)]
pub enum Error {
    /// The dataset directory does not exist.
    #[error("dataset directory {0:?} does not exist")]
    MissingDirectory(PathBuf),
    /// No decodable images were found.
    #[error("no images found in {0:?}")]
    EmptyDataset(PathBuf),
    /// An image could not be opened or decoded.
    #[error("failed to load image {path:?}")]
    Image {
        /// The file.
        path: PathBuf,
        /// The decoder error.
        #[source]
        source: image::ImageError,
    },
    /// Two tensors that must agree do not.
    #[error("shape mismatch in {op}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// The operation.
        op: &'static str,
        /// The expected shape.
        expected: Vec<usize>,
        /// The actual shape.
        found: Vec<usize>,
    },
    /// The image size can not be produced by the strided convolutions.
    #[error("image size {0} must be 4 * 2^k with k >= 1 (8, 16, 32, 64, ..)")]
    ImageSize(usize),
}

impl Error {
    pub(crate) fn shape_mismatch(op: &'static str, expected: &[usize], found: &[usize]) -> Self {
        Self::ShapeMismatch {
            op,
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}
