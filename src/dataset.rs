//! Batches and batch sources.
//!
//! Loading and decoding real video lives outside this crate; the trainer only
//! sees [`BatchSource`]. [`SyntheticVideoSource`] produces seeded Gaussian
//! clips for smoke runs and tests.

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::config::ModelSettings;
use crate::error::Result;

/// Pixel frames or already-encoded latents, both `[B,F,C,H,W]`.
#[derive(Debug, Clone)]
pub enum BatchInput {
    /// Raw frames; encoded by the frame compressor and scaled.
    Frames(Tensor),
    /// Latents produced offline; used as-is.
    Latents(Tensor),
}

impl BatchInput {
    #[must_use]
    pub fn tensor(&self) -> &Tensor {
        match self {
            BatchInput::Frames(t) | BatchInput::Latents(t) => t,
        }
    }
}

/// One training batch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input: BatchInput,
    /// Class labels, one per sample. Only read in conditional mode.
    pub labels: Option<Vec<u32>>,
}

impl Batch {
    /// Unconditional batch of raw frames.
    #[must_use]
    pub fn frames(frames: Tensor) -> Self {
        Self {
            input: BatchInput::Frames(frames),
            labels: None,
        }
    }

    /// Unconditional batch of pre-encoded latents.
    #[must_use]
    pub fn latents(latents: Tensor) -> Self {
        Self {
            input: BatchInput::Latents(latents),
            labels: None,
        }
    }

    /// Attach class labels.
    #[must_use]
    pub fn with_labels(mut self, labels: Vec<u32>) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Leading dimension of the input, if it has one.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.input.tensor().dims().first().copied().unwrap_or(0)
    }
}

/// Owned iterator over one pass of a source.
pub type EpochIter = Box<dyn Iterator<Item = Result<Batch>>>;

/// A finite, repeatable stream of batches.
pub trait BatchSource {
    /// Batches of pass `epoch`. The trainer calls this again with `epoch + 1`
    /// once the iterator is exhausted.
    fn epoch(&mut self, epoch: u64) -> Result<EpochIter>;
}

/// Seeded Gaussian video clips.
///
/// Batch `i` of epoch `e` depends only on the seed, `e` and `i`.
#[derive(Debug, Clone)]
pub struct SyntheticVideoSource {
    batch_size: usize,
    num_frames: usize,
    channels: usize,
    image_size: usize,
    num_classes: Option<usize>,
    batches_per_epoch: usize,
    seed: u64,
    device: Device,
}

impl SyntheticVideoSource {
    /// Clips shaped for `settings`, `batches_per_epoch` batches per pass.
    #[must_use]
    pub fn new(
        settings: &ModelSettings,
        batch_size: usize,
        batches_per_epoch: usize,
        seed: u64,
        device: Device,
    ) -> Self {
        Self {
            batch_size,
            num_frames: settings.num_frames,
            channels: settings.frame_channels,
            image_size: settings.image_size,
            num_classes: settings.conditional.then_some(settings.num_classes),
            batches_per_epoch,
            seed,
            device,
        }
    }

    fn make_batch(&self, epoch: u64, index: usize) -> Result<Batch> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(epoch * self.batches_per_epoch as u64 + index as u64);

        let shape = (
            self.batch_size,
            self.num_frames,
            self.channels,
            self.image_size,
            self.image_size,
        );
        let count = self.batch_size * self.num_frames * self.channels * self.image_size * self.image_size;
        let values: Vec<f32> = (0..count).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
        let frames = Tensor::from_vec(values, shape, &self.device)?;

        let mut batch = Batch::frames(frames);
        if let Some(classes) = self.num_classes {
            let labels = (0..self.batch_size)
                .map(|_| rng.gen_range(0..classes.max(1) as u32))
                .collect();
            batch = batch.with_labels(labels);
        }
        Ok(batch)
    }
}

impl BatchSource for SyntheticVideoSource {
    fn epoch(&mut self, epoch: u64) -> Result<EpochIter> {
        let source = self.clone();
        Ok(Box::new(
            (0..self.batches_per_epoch).map(move |i| source.make_batch(epoch, i)),
        ))
    }
}

/// A fixed list of batches replayed every epoch.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    batches: Vec<Batch>,
}

impl VecSource {
    #[must_use]
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }
}

impl BatchSource for VecSource {
    fn epoch(&mut self, _epoch: u64) -> Result<EpochIter> {
        Ok(Box::new(self.batches.clone().into_iter().map(Ok)))
    }
}
