use crate::{error::Error, result::Result};
use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

/// Training options.
///
/// All options are fixed when training starts. Missing keys in a JSON file take the
/// [`Default`] values.
///
///```
/// # use dcgan::config::TrainConfig;
/// let config: TrainConfig = serde_json::from_str(r#"{ "epochs": 2, "seed": 0 }"#).unwrap();
/// assert_eq!(config.batch_size, 64);
/// assert_eq!(config.epochs, 2);
///```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    /// Folder of training images.
    pub dataset_path: PathBuf,
    /// Images per batch. The last batch of an epoch may be smaller.
    pub batch_size: usize,
    /// Number of epochs.
    pub epochs: usize,
    /// Adam learning rate for both networks.
    pub learning_rate: f32,
    /// Width of the first discriminator / last generator hidden layer.
    pub hidden_size: usize,
    /// Length of the latent noise vector.
    pub latent_dim: usize,
    /// Height and width images are resized to.
    pub image_size: usize,
    /// Folder for snapshots and checkpoints.
    pub output_dir: PathBuf,
    /// Save a grid of generated images every `snapshot_interval` epochs.
    pub snapshot_interval: usize,
    /// Save both networks every `checkpoint_interval` epochs, starting with the first.
    pub checkpoint_interval: usize,
    /// Load existing checkpoints from `output_dir` before training.
    pub resume: bool,
    /// Seed for initialization, shuffling and noise. Uses entropy if `None`.
    pub seed: Option<u64>,
    /// Detach generated images from the generator while training the discriminator.
    pub detach_fake: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("images"),
            batch_size: 64,
            epochs: 10,
            learning_rate: 0.001,
            hidden_size: 64,
            latent_dim: 100,
            image_size: 64,
            output_dir: PathBuf::from("."),
            snapshot_interval: 1,
            checkpoint_interval: 5,
            resume: false,
            seed: None,
            detach_fake: true,
        }
    }
}

impl TrainConfig {
    /// Reads a JSON config.
    ///
    /// **Errors**
    /// - The file could not be read or parsed.
    /// - The config is invalid, see [`.validate()`](Self::validate).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {path:?}"))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse config {path:?}"))?;
        config.validate()?;
        Ok(config)
    }
    /// Checks that the options describe a trainable setup.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be at least 1!");
        ensure!(self.hidden_size > 0, "hidden_size must be at least 1!");
        ensure!(self.latent_dim > 0, "latent_dim must be at least 1!");
        ensure!(
            self.learning_rate > 0. && self.learning_rate <= 1.,
            "learning_rate {} must be in (0, 1]!",
            self.learning_rate
        );
        ensure!(
            self.snapshot_interval > 0 && self.checkpoint_interval > 0,
            "snapshot_interval and checkpoint_interval must be at least 1!"
        );
        upsample_stages(self.image_size)?;
        Ok(())
    }
}

/// The number of stride 2 stages `k` such that `image_size` = 4 * 2^k.
pub(crate) fn upsample_stages(image_size: usize) -> Result<usize> {
    if image_size >= 8 && image_size % 4 == 0 && (image_size / 4).is_power_of_two() {
        Ok((image_size / 4).trailing_zeros() as usize)
    } else {
        Err(Error::ImageSize(image_size).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        TrainConfig::default().validate().unwrap();
    }

    #[test]
    fn upsample_stages_of_image_sizes() {
        assert_eq!(upsample_stages(8).unwrap(), 1);
        assert_eq!(upsample_stages(16).unwrap(), 2);
        assert_eq!(upsample_stages(64).unwrap(), 4);
        for image_size in [0, 4, 12, 48, 65] {
            let error = upsample_stages(image_size).unwrap_err();
            assert!(matches!(
                error.downcast_ref::<Error>(),
                Some(Error::ImageSize(_))
            ));
        }
    }

    #[test]
    fn invalid_options() {
        let config = TrainConfig {
            batch_size: 0,
            ..TrainConfig::default()
        };
        assert!(config.validate().is_err());
        let config = TrainConfig {
            learning_rate: 2.,
            ..TrainConfig::default()
        };
        assert!(config.validate().is_err());
        let config = TrainConfig {
            checkpoint_interval: 0,
            ..TrainConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "batch_size": 8, "image_size": 32, "seed": 7 }"#)?;
        let config = TrainConfig::from_json_file(&path)?;
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.image_size, 32);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.latent_dim, 100);
        fs::write(&path, r#"{ "batch": 8 }"#)?;
        assert!(TrainConfig::from_json_file(&path).is_err());
        Ok(())
    }
}
