use clap::Parser;
use dcgan::{
    config::TrainConfig,
    dataset::image_folder::ImageFolder,
    learn::{
        gan::{self, Event, GanTrainer},
        neural_network::layer::Layer,
    },
    result::Result,
};
use indicatif::{ProgressBar, ProgressStyle};
use num_format::{Locale, ToFormattedString};
use std::path::PathBuf;

/// Trains a DCGAN on a folder of images.
///
/// Options given on the command line override the config file.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// JSON training config.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Folder of training images.
    #[arg(long)]
    dataset_path: Option<PathBuf>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f32>,
    #[arg(long)]
    hidden_size: Option<usize>,
    #[arg(long)]
    latent_dim: Option<usize>,
    /// Images are resized to image_size x image_size, a power of 2 >= 8.
    #[arg(long)]
    image_size: Option<usize>,
    /// Folder for image grids and checkpoints.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    snapshot_interval: Option<usize>,
    #[arg(long)]
    checkpoint_interval: Option<usize>,
    /// Continue from the checkpoints in output_dir.
    #[arg(long)]
    resume: bool,
    #[arg(long)]
    seed: Option<u64>,
    /// Let the discriminator loss on generated images reach the generator.
    #[arg(long)]
    no_detach_fake: bool,
}

impl Cli {
    fn into_config(self) -> Result<TrainConfig> {
        let Self {
            config,
            dataset_path,
            batch_size,
            epochs,
            learning_rate,
            hidden_size,
            latent_dim,
            image_size,
            output_dir,
            snapshot_interval,
            checkpoint_interval,
            resume,
            seed,
            no_detach_fake,
        } = self;
        let mut config = match config {
            Some(path) => TrainConfig::from_json_file(path)?,
            None => TrainConfig::default(),
        };
        macro_rules! merge {
            ($($field:ident),*) => {
                $(
                    if let Some(value) = $field {
                        config.$field = value;
                    }
                )*
            };
        }
        merge!(
            dataset_path,
            batch_size,
            epochs,
            learning_rate,
            hidden_size,
            latent_dim,
            image_size,
            output_dir,
            snapshot_interval,
            checkpoint_interval
        );
        if seed.is_some() {
            config.seed = seed;
        }
        config.resume |= resume;
        if no_detach_fake {
            config.detach_fake = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let config = Cli::parse().into_config()?;
    let dataset = ImageFolder::builder(&config.dataset_path)
        .image_size(config.image_size)
        .build()?;
    println!(
        "Found {} images in {:?}",
        dataset.files().len().to_formatted_string(&Locale::en),
        dataset.path()
    );
    let mut trainer = GanTrainer::new(&config)?;
    println!(
        "The Discriminator has {} trainable parameters",
        trainer
            .discriminator()
            .parameter_count()
            .to_formatted_string(&Locale::en)
    );
    println!(
        "The Generator has {} trainable parameters",
        trainer
            .generator()
            .parameter_count()
            .to_formatted_string(&Locale::en)
    );

    let style = ProgressStyle::default_bar()
        .template("Epoch {msg} [{bar:40}] {pos:>5}/{len:5} [eta: {eta}]")?
        .progress_chars("=> ");
    let mut bar: Option<ProgressBar> = None;
    let summary = gan::fit(&mut trainer, &dataset, &config, |event| {
        match event {
            Event::Step {
                epoch,
                batch,
                batches,
                ..
            } => {
                let bar = bar.get_or_insert_with(|| {
                    let bar = ProgressBar::new(batches as u64).with_style(style.clone());
                    bar.set_message(format!("{}/{}", epoch + 1, config.epochs));
                    bar
                });
                bar.set_position(batch as u64 + 1);
            }
            Event::Snapshot { path, .. } => {
                let message = format!("Saved {path:?}");
                match &bar {
                    Some(bar) => bar.println(message),
                    None => println!("{message}"),
                }
            }
            Event::Epoch(stats) => {
                if let Some(bar) = bar.take() {
                    bar.finish_and_clear();
                }
                println!("{stats}");
            }
            Event::Checkpoint {
                generator,
                discriminator,
                ..
            } => {
                println!("Saved {generator:?} and {discriminator:?}");
            }
        }
        Ok(())
    })?;
    println!(
        "Trained {} epochs in {:.2?}",
        summary.epoch(),
        summary.total_time()
    );
    Ok(())
}
