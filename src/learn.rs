use crate::result::Result;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Criterion.
pub mod criterion;
/// Adversarial training.
pub mod gan;
/// Neural Networks.
pub mod neural_network;

/// Training statistics.
///
/// Sums of the per batch losses, averaged over the number of batches.
#[derive(Default, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    count: usize,
    discriminator_loss: f32,
    generator_loss: f32,
}

impl Stats {
    /// Adds the losses of one batch.
    pub fn add_batch(&mut self, discriminator_loss: f32, generator_loss: f32) {
        self.count += 1;
        self.discriminator_loss += discriminator_loss;
        self.generator_loss += generator_loss;
    }
    /// The number of batches.
    pub fn count(&self) -> usize {
        self.count
    }
    /// The mean discriminator loss, real plus fake.
    ///
    /// 0 if no batches were added.
    pub fn discriminator_loss(&self) -> f32 {
        if self.count > 0 {
            self.discriminator_loss / self.count as f32
        } else {
            0.
        }
    }
    /// The mean generator loss.
    ///
    /// 0 if no batches were added.
    pub fn generator_loss(&self) -> f32 {
        if self.count > 0 {
            self.generator_loss / self.count as f32
        } else {
            0.
        }
    }
}

/// Summary of training.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    epoch: usize,
    epoch_time: Duration,
    total_time: Duration,
    train: Stats,
}

impl Summary {
    /// Runs an epoch with `f`.
    ///
    /// Times `f`. If `f` returns `Ok`, updates the epoch time and accumulates the total time and the epoch. Otherwise returns the error.
    pub fn run_epoch<F>(&mut self, mut f: F) -> Result<Stats>
    where
        F: FnMut(&Self) -> Result<Stats>,
    {
        let start = Instant::now();
        let train = f(self)?;
        self.epoch_time = start.elapsed();
        self.total_time += self.epoch_time;
        self.epoch += 1;
        self.train = train;
        Ok(train)
    }
    /// The number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
    /// Duration of the last epoch.
    pub fn epoch_time(&self) -> Duration {
        self.epoch_time
    }
    /// Duration of all epochs.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }
    /// Stats of the last epoch.
    pub fn train(&self) -> &Stats {
        &self.train
    }
}

/// Summerizes the trainer.
pub trait Summarize {
    /// Returns a summary.
    fn summarize(&self) -> Summary;
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[test]
    fn stats_average_batches() {
        let mut stats = Stats::default();
        assert_eq!(stats.discriminator_loss(), 0.);
        stats.add_batch(1., 4.);
        stats.add_batch(2., 2.);
        assert_eq!(stats.count(), 2);
        assert_eq!(stats.discriminator_loss(), 1.5);
        assert_eq!(stats.generator_loss(), 3.);
    }

    #[test]
    fn run_epoch() -> Result<()> {
        let mut summary = Summary::default();
        summary.run_epoch(|summary| {
            assert_eq!(summary.epoch(), 0);
            let mut stats = Stats::default();
            stats.add_batch(1., 1.);
            Ok(stats)
        })?;
        assert_eq!(summary.epoch(), 1);
        assert_eq!(summary.train().count(), 1);
        assert!(summary.run_epoch(|_| bail!("failed")).is_err());
        assert_eq!(summary.epoch(), 1);
        Ok(())
    }
}
