//! Minibatch iterator
//!
//! Examples are never moved: a [`Cursor`] owns a permutation of example indices and a pointer
//! into it. Crossing the end of the permutation is the one explicit state transition, a
//! reshuffle followed by a restart at zero.

use std::ops::Range;

use rand::{SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error("Batch size must be at least 1")]
    EmptyBatch,
    #[error("Batch size {batch_size} exceeds the number of examples {num_examples}")]
    BatchTooLarge {
        batch_size: usize,
        num_examples: usize,
    },
    #[error("Labels must have the same length as the data")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
}

/// Position of an iterator within the current ordering of the examples
#[derive(Debug, Clone)]
pub struct Cursor {
    pointer: usize,
    batch_size: usize,
    permutation: Vec<usize>,
    reshuffles: usize,
    rng: Pcg64Mcg,
}

impl Cursor {
    /// Starts at the identity ordering, the first pass sees the examples in storage order
    pub fn new(num_examples: usize, batch_size: usize, seed: u64) -> Self {
        Self {
            pointer: 0,
            batch_size,
            permutation: (0..num_examples).collect(),
            reshuffles: 0,
            rng: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    pub fn pointer(&self) -> usize {
        self.pointer
    }

    /// Number of reshuffles performed so far
    pub fn reshuffles(&self) -> usize {
        self.reshuffles
    }

    /// Current ordering of example indices
    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    pub fn num_examples(&self) -> usize {
        self.permutation.len()
    }

    /// Draws a fresh ordering and rewinds to the start
    pub fn reshuffle(&mut self) {
        self.permutation.shuffle(&mut self.rng);
        self.pointer = 0;
        self.reshuffles += 1;
    }

    /// Moves past the next batch and returns the positions it covers in [`Self::permutation`].
    /// A batch that would run past the end triggers one reshuffle instead, so the
    /// remainder of the previous pass is never returned.
    pub fn advance(&mut self) -> Range<usize> {
        if self.pointer + self.batch_size > self.num_examples() {
            self.reshuffle();
        }
        let start = self.pointer;
        self.pointer += self.batch_size;
        start..self.pointer
    }
}

/// One minibatch, `labels` is index aligned with `features` when present
#[derive(Debug, PartialEq)]
pub struct Batch<'a, X, Y> {
    pub features: Vec<&'a X>,
    pub labels: Option<Vec<&'a Y>>,
}

impl<X, Y> Batch<'_, X, Y> {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

fn gather<'a, X, Y>(
    features: &'a [X],
    labels: Option<&'a [Y]>,
    indices: &[usize],
) -> Batch<'a, X, Y> {
    Batch {
        features: indices.iter().map(|&i| &features[i]).collect(),
        labels: labels.map(|l| indices.iter().map(|&i| &l[i]).collect()),
    }
}

/// Serves fixed size batches of examples and optional labels, reshuffling both with one
/// shared permutation whenever a pass is exhausted
pub struct DataIterator<X, Y = ()> {
    features: Vec<X>,
    labels: Option<Vec<Y>>,
    batch_size: usize,
    cursor: Cursor,
}

impl<X> DataIterator<X, ()> {
    /// Iterator over features only
    pub fn unlabeled(
        features: Vec<X>,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self, DataLoaderError> {
        Self::build(features, None, batch_size, seed)
    }
}

impl<X, Y> DataIterator<X, Y> {
    pub fn new(
        features: Vec<X>,
        labels: Vec<Y>,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self, DataLoaderError> {
        if features.len() != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len: features.len(),
            });
        }
        Self::build(features, Some(labels), batch_size, seed)
    }

    fn build(
        features: Vec<X>,
        labels: Option<Vec<Y>>,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::EmptyBatch);
        }
        if batch_size > features.len() {
            return Err(DataLoaderError::BatchTooLarge {
                batch_size,
                num_examples: features.len(),
            });
        }
        let cursor = Cursor::new(features.len(), batch_size, seed);
        Ok(Self {
            features,
            labels,
            batch_size,
            cursor,
        })
    }

    pub fn num_examples(&self) -> usize {
        self.features.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whole batches per pass
    pub fn num_batches(&self) -> usize {
        self.features.len() / self.batch_size
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// Returns the next batch, reshuffling first if the current pass cannot fill it
    pub fn next_batch(&mut self) -> Batch<'_, X, Y> {
        let range = self.cursor.advance();
        gather(
            &self.features,
            self.labels.as_deref(),
            &self.cursor.permutation()[range],
        )
    }

    /// Lazily yields [`Self::num_batches`] batches. The cursor is not rewound, so calling
    /// this again picks up where the previous pass stopped.
    pub fn iterate(&mut self) -> Iterate<'_, X, Y> {
        Iterate {
            remaining: self.num_batches(),
            features: &self.features,
            labels: self.labels.as_deref(),
            cursor: &mut self.cursor,
        }
    }
}

/// Finite iterator returned by [`DataIterator::iterate`]
pub struct Iterate<'a, X, Y> {
    features: &'a [X],
    labels: Option<&'a [Y]>,
    cursor: &'a mut Cursor,
    remaining: usize,
}

impl<'a, X, Y> Iterator for Iterate<'a, X, Y> {
    type Item = Batch<'a, X, Y>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let range = self.cursor.advance();
        Some(gather(
            self.features,
            self.labels,
            &self.cursor.permutation()[range],
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
