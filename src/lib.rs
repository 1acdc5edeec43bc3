/*!
# dcgan
Trains a deep convolutional generative adversarial network on a folder of images.

A [`Generator`](learn::gan::Generator) maps standard normal noise to images, a
[`Discriminator`](learn::gan::Discriminator) predicts whether an image is real or
generated, and the [`GanTrainer`](learn::gan::GanTrainer) alternates their updates.

Everything runs on the host with [ndarray](https://docs.rs/ndarray); the small autograd engine
in [`learn::neural_network::autograd`] differentiates the layers in
[`learn::neural_network::layer`].

```no_run
# use dcgan::{config::TrainConfig, dataset::image_folder::ImageFolder, learn::gan::{self, GanTrainer}, result::Result};
# fn main() -> Result<()> {
let config = TrainConfig::default();
let dataset = ImageFolder::builder(&config.dataset_path)
    .image_size(config.image_size)
    .build()?;
let mut trainer = GanTrainer::new(&config)?;
gan::fit(&mut trainer, &dataset, &config, |event| {
    if let gan::Event::Epoch(stats) = event {
        println!("{stats}");
    }
    Ok(())
})?;
# Ok(())
# }
```
*/
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Training configuration.
pub mod config;
/// Datasets.
pub mod dataset;
/// Errors.
pub mod error;
/// Machine learning.
pub mod learn;
/// Host kernels shared by layers.
pub mod ops;

/// Result type.
pub mod result {
    pub use anyhow::Result;
}
