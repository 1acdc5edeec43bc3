use crate::{
    config::{upsample_stages, TrainConfig},
    dataset::Dataset,
    error::Error,
    learn::{
        criterion::{BCELoss, Criterion},
        neural_network::{
            autograd::{Variable, Variable4, VariableD},
            layer::{
                BatchNorm, Conv, ConvTranspose, Flatten, Forward, Layer, LeakyRelu, Relu, Sigmoid,
                Tanh,
            },
            optimizer::Adam,
        },
        Stats, Summarize, Summary,
    },
    result::Result,
};
use anyhow::Context;
use artifacts::SavedModel;
use ndarray::{Array, Array2, Array4, Ix2, Ix4};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Image grids and checkpoints.
pub mod artifacts;

/// File name of the generator checkpoint, without extension.
pub const GENERATOR_CHECKPOINT: &str = "generator";
/// File name of the discriminator checkpoint, without extension.
pub const DISCRIMINATOR_CHECKPOINT: &str = "discriminator";

fn check_input(op: &'static str, input: &VariableD, expected: [usize; 3]) -> Result<()> {
    let shape = input.shape();
    if shape.len() != 4 || shape[1..] != expected {
        let batch_size = shape.first().copied().unwrap_or(0);
        let [c, h, w] = expected;
        return Err(Error::shape_mismatch(op, &[batch_size, c, h, w], shape).into());
    }
    Ok(())
}

#[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
#[dcgan(crate)]
struct DownBlock {
    #[dcgan(layer)]
    conv: Conv,
    #[dcgan(layer)]
    norm: BatchNorm,
    #[dcgan(layer)]
    activation: LeakyRelu,
}

/// Discriminator.
///
/// Classifies [B, 3, S, S] images as real (1) or generated (0), outputs probabilities [B, 1].
///
/// For `image_size` S = 4 * 2^k and `hidden_size` h:
/// - Conv 3 => h, stride 2, and LeakyRelu
/// - k - 1 blocks of Conv c => 2c, stride 2, BatchNorm and LeakyRelu
/// - Conv c => 1 down to 1 x 1, and Sigmoid
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[dcgan(crate)]
pub struct Discriminator {
    #[dcgan(layer)]
    conv: Conv,
    #[dcgan(layer)]
    activation: LeakyRelu,
    #[dcgan(layer)]
    blocks: Vec<DownBlock>,
    #[dcgan(layer)]
    output: Conv,
    #[dcgan(layer)]
    flatten: Flatten,
    #[dcgan(layer)]
    sigmoid: Sigmoid,
    image_size: usize,
}

impl Discriminator {
    /// Creates a discriminator for `image_size` images, sampling parameters from `rng`.
    ///
    /// **Errors**
    /// `image_size` is not 4 * 2^k with k >= 1, or `hidden_size` is 0.
    pub fn new<R: Rng + ?Sized>(hidden_size: usize, image_size: usize, rng: &mut R) -> Result<Self> {
        let stages = upsample_stages(image_size)?;
        let down = |inputs, outputs, rng: &mut R| {
            Conv::builder()
                .inputs(inputs)
                .outputs(outputs)
                .filter(4)
                .stride(2)
                .padding(1)
                .build(rng)
        };
        let conv = down(3, hidden_size, rng)?;
        let mut channels = hidden_size;
        let mut blocks = Vec::with_capacity(stages - 1);
        for _ in 1..stages {
            blocks.push(DownBlock {
                conv: down(channels, 2 * channels, rng)?,
                norm: BatchNorm::from_channels(2 * channels),
                activation: LeakyRelu::default(),
            });
            channels *= 2;
        }
        let output = Conv::builder()
            .inputs(channels)
            .outputs(1)
            .filter(4)
            .build(rng)?;
        Ok(Self {
            conv,
            activation: LeakyRelu::default(),
            blocks,
            output,
            flatten: Flatten,
            sigmoid: Sigmoid,
            image_size,
        })
    }
    /// Height and width of the input images.
    pub fn image_size(&self) -> usize {
        self.image_size
    }
}

impl Forward for Discriminator {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        let size = self.image_size;
        check_input("Discriminator", &input, [3, size, size])?;
        input
            .forward(&self.conv)?
            .forward(&self.activation)?
            .forward(&self.blocks)?
            .forward(&self.output)?
            .forward(&self.flatten)?
            .forward(&self.sigmoid)
    }
}

#[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
#[dcgan(crate)]
struct UpBlock {
    #[dcgan(layer)]
    conv: ConvTranspose,
    #[dcgan(layer)]
    norm: BatchNorm,
    #[dcgan(layer)]
    activation: Relu,
}

/// Generator.
///
/// Maps [B, latent_dim, 1, 1] standard normal noise to [B, 3, S, S] images in [-1, 1].
///
/// For `image_size` S = 4 * 2^k and `hidden_size` h:
/// - ConvTranspose latent_dim => h * 2^(k - 1) up to 4 x 4, BatchNorm and Relu
/// - k - 1 blocks of ConvTranspose c => c / 2, stride 2, BatchNorm and Relu
/// - ConvTranspose h => 3, stride 2, and Tanh
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[dcgan(crate)]
pub struct Generator {
    #[dcgan(layer)]
    input: UpBlock,
    #[dcgan(layer)]
    blocks: Vec<UpBlock>,
    #[dcgan(layer)]
    output: ConvTranspose,
    #[dcgan(layer)]
    tanh: Tanh,
    latent_dim: usize,
    image_size: usize,
}

impl Generator {
    /// Creates a generator for `image_size` images, sampling parameters from `rng`.
    ///
    /// **Errors**
    /// `image_size` is not 4 * 2^k with k >= 1, or `latent_dim` or `hidden_size` is 0.
    pub fn new<R: Rng + ?Sized>(
        latent_dim: usize,
        hidden_size: usize,
        image_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let stages = upsample_stages(image_size)?;
        let mut channels = hidden_size << (stages - 1);
        let input = UpBlock {
            conv: ConvTranspose::builder()
                .inputs(latent_dim)
                .outputs(channels)
                .filter(4)
                .build(rng)?,
            norm: BatchNorm::from_channels(channels),
            activation: Relu,
        };
        let up = |inputs, outputs, rng: &mut R| {
            ConvTranspose::builder()
                .inputs(inputs)
                .outputs(outputs)
                .filter(4)
                .stride(2)
                .padding(1)
                .build(rng)
        };
        let mut blocks = Vec::with_capacity(stages - 1);
        for _ in 1..stages {
            blocks.push(UpBlock {
                conv: up(channels, channels / 2, rng)?,
                norm: BatchNorm::from_channels(channels / 2),
                activation: Relu,
            });
            channels /= 2;
        }
        let output = up(channels, 3, rng)?;
        Ok(Self {
            input,
            blocks,
            output,
            tanh: Tanh,
            latent_dim,
            image_size,
        })
    }
    /// Length of the noise vector.
    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }
    /// Height and width of the generated images.
    pub fn image_size(&self) -> usize {
        self.image_size
    }
}

impl Forward for Generator {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        check_input("Generator", &input, [self.latent_dim, 1, 1])?;
        input
            .forward(&self.input)?
            .forward(&self.blocks)?
            .forward(&self.output)?
            .forward(&self.tanh)
    }
}

/// Losses and generated images of one training step.
#[derive(Clone, Debug)]
pub struct StepStats {
    /// Real plus fake discriminator loss.
    pub discriminator_loss: f32,
    /// Generator loss.
    pub generator_loss: f32,
    /// The images generated while training the generator, [B, 3, S, S] in [-1, 1].
    pub fake_images: Array4<f32>,
}

/// Statistics of one epoch.
#[derive(Clone, Copy, Debug)]
pub struct EpochStats {
    /// The epoch, starting at 0.
    pub epoch: usize,
    /// The number of epochs.
    pub epochs: usize,
    /// The losses.
    pub stats: Stats,
    /// Duration of the epoch.
    pub epoch_time: Duration,
}

impl Display for EpochStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Epoch [{}/{}], Discriminator Loss: {:.4}, Generator Loss: {:.4}",
            self.epoch + 1,
            self.epochs,
            self.stats.discriminator_loss(),
            self.stats.generator_loss()
        )
    }
}

/// Progress reported by [`fit()`].
#[derive(Debug)]
pub enum Event<'a> {
    /// A batch was trained.
    Step {
        /// The epoch.
        epoch: usize,
        /// The batch index within the epoch.
        batch: usize,
        /// Batches per epoch.
        batches: usize,
        /// The losses.
        stats: &'a StepStats,
    },
    /// An image grid was saved.
    Snapshot {
        /// The epoch.
        epoch: usize,
        /// The image file.
        path: &'a Path,
    },
    /// An epoch completed.
    Epoch(&'a EpochStats),
    /// Both networks were saved.
    Checkpoint {
        /// The epoch.
        epoch: usize,
        /// The generator file.
        generator: &'a Path,
        /// The discriminator file.
        discriminator: &'a Path,
    },
}

/// Trains a [`Generator`] and a [`Discriminator`] against each other.
///
/// Owns both networks, an [`Adam`] optimizer for each, and the random number generator used
/// for initialization, shuffling and noise.
#[derive(Debug)]
pub struct GanTrainer {
    generator: Generator,
    discriminator: Discriminator,
    generator_optimizer: Adam,
    discriminator_optimizer: Adam,
    criterion: BCELoss,
    learning_rate: f32,
    detach_fake: bool,
    rng: StdRng,
    summary: Summary,
}

impl GanTrainer {
    /// Creates both networks and optimizers from `config`.
    ///
    /// If `config.seed` is `None`, the random number generator is seeded from entropy.
    ///
    /// **Errors**
    /// The config is invalid, see [`TrainConfig::validate()`].
    pub fn new(config: &TrainConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let mut discriminator = Discriminator::new(config.hidden_size, config.image_size, &mut rng)?;
        let mut generator = Generator::new(
            config.latent_dim,
            config.hidden_size,
            config.image_size,
            &mut rng,
        )?;
        discriminator.set_training(true)?;
        generator.set_training(true)?;
        Ok(Self {
            generator,
            discriminator,
            generator_optimizer: Adam::default(),
            discriminator_optimizer: Adam::default(),
            criterion: BCELoss,
            learning_rate: config.learning_rate,
            detach_fake: config.detach_fake,
            rng,
            summary: Summary::default(),
        })
    }
    /// The generator.
    pub fn generator(&self) -> &Generator {
        &self.generator
    }
    /// The discriminator.
    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }
    /// Samples standard normal noise, [batch_size, latent_dim, 1, 1].
    pub fn sample_noise(&mut self, batch_size: usize) -> Array4<f32> {
        let latent_dim = self.generator.latent_dim();
        let rng = &mut self.rng;
        Array::from_shape_simple_fn([batch_size, latent_dim, 1, 1], || {
            rng.sample::<f32, _>(StandardNormal)
        })
    }
    /// Generates `batch_size` images from fresh noise.
    pub fn generate(&mut self, batch_size: usize) -> Result<Array4<f32>> {
        let noise = self.sample_noise(batch_size);
        let images = self.generator.forward(Variable::from(noise).into_dyn())?;
        Ok(images.into_value().into_dimensionality::<Ix4>()?.into_owned())
    }
    fn discriminate(&self, images: VariableD) -> Result<Variable<Ix2>> {
        Ok(self.discriminator.forward(images)?.into_dimensionality::<Ix2>()?)
    }
    /// Accumulates discriminator gradients for `real` labeled 1 and generated images labeled 0.
    ///
    /// Returns the real plus fake loss.
    fn discriminator_backward(&mut self, real: Array4<f32>) -> Result<f32> {
        let batch_size = real.dim().0;
        let real_labels = Array2::<f32>::ones([batch_size, 1]).into_shared();
        let fake_labels = Array2::<f32>::zeros([batch_size, 1]).into_shared();

        self.discriminator.zero_grad();
        self.generator.zero_grad();
        let real_output = self.discriminate(Variable4::from(real).into_dyn())?;
        let real_loss = self.criterion.eval(real_output, real_labels)?;
        real_loss.backward()?;

        let noise = self.sample_noise(batch_size);
        let fake = self.generator.forward(Variable::from(noise).into_dyn())?;
        let fake = if self.detach_fake { fake.detach() } else { fake };
        let fake_output = self.discriminate(fake)?;
        let fake_loss = self.criterion.eval(fake_output, fake_labels)?;
        fake_loss.backward()?;
        Ok(real_loss.item() + fake_loss.item())
    }
    /// Trains both networks on one batch of real images.
    ///
    /// 1. The discriminator is trained to output 1 for `real` and 0 for generated images.
    /// 2. The generator is trained to make the updated discriminator output 1 for new
    /// generated images.
    pub fn train_step(&mut self, real: Array4<f32>) -> Result<StepStats> {
        let batch_size = real.dim().0;
        let discriminator_loss = self.discriminator_backward(real)?;
        self.discriminator
            .update(self.learning_rate, &self.discriminator_optimizer)?;

        self.discriminator.zero_grad();
        self.generator.zero_grad();
        let real_labels = Array2::<f32>::ones([batch_size, 1]).into_shared();
        let noise = self.sample_noise(batch_size);
        let fake = self.generator.forward(Variable::from(noise).into_dyn())?;
        let fake_images = fake
            .value()
            .clone()
            .into_dimensionality::<Ix4>()?
            .into_owned();
        let output = self.discriminate(fake)?;
        let generator_loss = self.criterion.eval(output, real_labels)?;
        generator_loss.backward()?;
        self.generator
            .update(self.learning_rate, &self.generator_optimizer)?;

        Ok(StepStats {
            discriminator_loss,
            generator_loss: generator_loss.item(),
            fake_images,
        })
    }
    /// Saves both networks to `dir`, overwriting existing checkpoints.
    ///
    /// Returns the generator and discriminator files.
    pub fn save_checkpoint(&self, dir: impl AsRef<Path>) -> Result<(PathBuf, PathBuf)> {
        let dir = dir.as_ref();
        let generator = SavedModel::new(&self.generator).save(dir.join(GENERATOR_CHECKPOINT))?;
        let discriminator =
            SavedModel::new(&self.discriminator).save(dir.join(DISCRIMINATOR_CHECKPOINT))?;
        Ok((generator, discriminator))
    }
    /// Loads both networks from checkpoints in `dir`.
    ///
    /// Optimizer state is reset.
    ///
    /// **Errors**
    /// The files could not be read, or the saved networks have different shapes.
    pub fn load_checkpoint(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let mut generator: Generator = SavedModel::load(dir.join(GENERATOR_CHECKPOINT))?.into_model();
        let mut discriminator: Discriminator =
            SavedModel::load(dir.join(DISCRIMINATOR_CHECKPOINT))?.into_model();
        check_parameter_shapes("Generator", &self.generator, &generator)?;
        check_parameter_shapes("Discriminator", &self.discriminator, &discriminator)?;
        generator.set_training(true)?;
        discriminator.set_training(true)?;
        self.generator = generator;
        self.discriminator = discriminator;
        Ok(())
    }
}

fn check_parameter_shapes<L: Layer>(op: &'static str, expected: &L, found: &L) -> Result<()> {
    let expected = expected.parameters();
    let found = found.parameters();
    if expected.len() != found.len() {
        return Err(Error::shape_mismatch(op, &[expected.len()], &[found.len()]).into());
    }
    for (expected, found) in expected.iter().zip(found.iter()) {
        if expected.shape() != found.shape() {
            return Err(Error::shape_mismatch(op, expected.shape(), found.shape()).into());
        }
    }
    Ok(())
}

impl Summarize for GanTrainer {
    fn summarize(&self) -> Summary {
        self.summary.clone()
    }
}

/// Trains for `config.epochs` epochs over `dataset`.
///
/// Batches are reshuffled every epoch. On the first batch of every `config.snapshot_interval`
/// epochs the generated images are saved to `epoch_{epoch}.png` in `config.output_dir`. After
/// every epoch with `epoch % config.checkpoint_interval == 0`, starting with epoch 0, both
/// networks are saved. If `config.resume`, checkpoints are loaded before training.
///
/// `callback` is called with each [`Event`], an error stops training.
pub fn fit<A, F>(
    trainer: &mut GanTrainer,
    dataset: &A,
    config: &TrainConfig,
    mut callback: F,
) -> Result<Summary>
where
    A: Dataset<Item = Array4<f32>>,
    F: FnMut(Event) -> Result<()>,
{
    config.validate()?;
    let output_dir = config.output_dir.as_path();
    fs::create_dir_all(output_dir).with_context(|| format!("failed to create {output_dir:?}"))?;
    if config.resume {
        trainer
            .load_checkpoint(output_dir)
            .context("failed to resume training")?;
    }
    for epoch in 0..config.epochs {
        let mut summary = std::mem::take(&mut trainer.summary);
        let result = summary.run_epoch(|_| train_epoch(trainer, dataset, config, epoch, &mut callback));
        let epoch_time = summary.epoch_time();
        trainer.summary = summary;
        let stats = result?;
        let epoch_stats = EpochStats {
            epoch,
            epochs: config.epochs,
            stats,
            epoch_time,
        };
        callback(Event::Epoch(&epoch_stats))?;
        if epoch % config.checkpoint_interval == 0 {
            let (generator, discriminator) = trainer.save_checkpoint(output_dir)?;
            callback(Event::Checkpoint {
                epoch,
                generator: &generator,
                discriminator: &discriminator,
            })?;
        }
    }
    Ok(trainer.summarize())
}

fn train_epoch<A, F>(
    trainer: &mut GanTrainer,
    dataset: &A,
    config: &TrainConfig,
    epoch: usize,
    callback: &mut F,
) -> Result<Stats>
where
    A: Dataset<Item = Array4<f32>>,
    F: FnMut(Event) -> Result<()>,
{
    let batches = dataset.batches(config.batch_size, Some(&mut trainer.rng));
    let batch_count = batches.len();
    let mut stats = Stats::default();
    for (index, batch) in batches.enumerate() {
        let step = trainer.train_step(batch?)?;
        stats.add_batch(step.discriminator_loss, step.generator_loss);
        if index == 0 && epoch % config.snapshot_interval == 0 {
            let path = config.output_dir.join(format!("epoch_{epoch}.png"));
            artifacts::save_image_grid(step.fake_images.view(), &path)?;
            callback(Event::Snapshot { epoch, path: &path })?;
        }
        callback(Event::Step {
            epoch,
            batch: index,
            batches: batch_count,
            stats: &step,
        })?;
    }
    Ok(stats)
}
