use crate::result::Result;
use anyhow::bail;
use ndarray::{Array4, ArrayBase, Axis, Data, Ix4};
use rand::{rngs::StdRng, seq::SliceRandom};
use std::vec::IntoIter as VecIntoIter;

/// Images loaded from a directory.
pub mod image_folder;

/// Dataset.
///
/// An indexable collection of samples that can be iterated in batches.
pub trait Dataset {
    /// A batch of samples.
    type Item;
    /// The number of samples.
    fn sample_count(&self) -> usize;
    /// Loads the samples at `indices` as one batch, in order.
    ///
    /// **Errors**
    /// An index is out of bounds or a sample could not be loaded.
    fn sample(&self, indices: &[usize]) -> Result<Self::Item>;
    /// An iterator over batches of `batch_size`.
    ///
    /// The last batch is smaller if `batch_size` does not divide the sample count. If `shuffle`
    /// is provided the order of samples is permuted with it, otherwise samples are in order.
    fn batches(&self, batch_size: usize, shuffle: Option<&mut StdRng>) -> Batches<'_, Self>
    where
        Self: Sized,
    {
        let batch_size = batch_size.max(1);
        let mut indices: Vec<usize> = (0..self.sample_count()).collect();
        if let Some(rng) = shuffle {
            indices.shuffle(rng);
        }
        let batches: Vec<Vec<usize>> = indices
            .chunks(batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        Batches {
            dataset: self,
            batches: batches.into_iter(),
        }
    }
}

/// Iterator over the batches of a [`Dataset`].
///
/// Created by [`Dataset::batches()`].
pub struct Batches<'a, A> {
    dataset: &'a A,
    batches: VecIntoIter<Vec<usize>>,
}

impl<A: Dataset> Iterator for Batches<'_, A> {
    type Item = Result<A::Item>;
    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.batches.next()?;
        Some(self.dataset.sample(&indices))
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.batches.size_hint()
    }
}

impl<A: Dataset> ExactSizeIterator for Batches<'_, A> {}

impl<S: Data<Elem = f32>> Dataset for ArrayBase<S, Ix4> {
    type Item = Array4<f32>;
    fn sample_count(&self) -> usize {
        self.dim().0
    }
    fn sample(&self, indices: &[usize]) -> Result<Self::Item> {
        let sample_count = self.sample_count();
        if let Some(index) = indices.iter().find(|index| **index >= sample_count) {
            bail!("Index {index} out of bounds for {sample_count} samples!");
        }
        Ok(self.select(Axis(0), indices))
    }
}
