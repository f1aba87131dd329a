//! Collaborator traits for the generative network and the frame compressor,
//! with small reference implementations.

use candle_core::Tensor;
use candle_nn::{Embedding, Init, Module, VarBuilder};

use crate::config::ModelSettings;
use crate::error::{LatteError, Result};

/// Scale applied to compressor outputs before diffusion.
pub const LATENT_SCALE: f64 = 0.18215;

/// A network that predicts the diffusion target from a noised latent.
pub trait DenoisingModel {
    /// `x` is `[B,F,C,H,W]`, `t` holds one `u32` timestep per sample and
    /// `cond` holds one class label per sample in conditional mode.
    fn forward(&self, x: &Tensor, t: &Tensor, cond: Option<&Tensor>) -> Result<Tensor>;
}

/// Frozen encoder from pixel frames to latents.
pub trait FrameCompressor {
    /// Encode `[N,C,H,W]` frames into `[N,C',H',W']` latents.
    fn encode(&self, frames: &Tensor) -> Result<Tensor>;
}

impl<M: DenoisingModel + ?Sized> DenoisingModel for Box<M> {
    fn forward(&self, x: &Tensor, t: &Tensor, cond: Option<&Tensor>) -> Result<Tensor> {
        (**self).forward(x, t, cond)
    }
}

/// Per-channel affine denoiser with additive timestep and class embeddings.
///
/// Initialised to the identity map, so its first prediction is its input.
#[derive(Debug)]
pub struct TinyDenoiser {
    scale: Tensor,
    shift: Tensor,
    t_embed: Embedding,
    y_embed: Option<Embedding>,
    channels: usize,
}

impl TinyDenoiser {
    /// Create the denoiser inside `vb`.
    pub fn new(settings: &ModelSettings, num_timesteps: usize, vb: VarBuilder) -> Result<Self> {
        let channels = settings.frame_channels;
        let scale = vb.get_with_hints(channels, "scale", Init::Const(1.0))?;
        let shift = vb.get_with_hints(channels, "shift", Init::Const(0.0))?;
        let t_w = vb.get_with_hints((num_timesteps, channels), "t_embed.weight", Init::Const(0.0))?;

        // the extra row is the unconditional class
        let y_embed = if settings.conditional {
            let y_w = vb.get_with_hints(
                (settings.num_classes + 1, channels),
                "y_embed.weight",
                Init::Const(0.0),
            )?;
            Some(Embedding::new(y_w, channels))
        } else {
            None
        };

        Ok(Self {
            scale,
            shift,
            t_embed: Embedding::new(t_w, channels),
            y_embed,
            channels,
        })
    }
}

impl DenoisingModel for TinyDenoiser {
    fn forward(&self, x: &Tensor, t: &Tensor, cond: Option<&Tensor>) -> Result<Tensor> {
        let (b, _f, c, _h, _w) = x.dims5()?;
        if c != self.channels {
            return Err(LatteError::MalformedBatch(format!(
                "denoiser expects {} channels, got {c}",
                self.channels
            )));
        }
        let per_channel = |v: &Tensor| v.reshape((1, 1, c, 1, 1));
        let per_sample = |v: Tensor| v.reshape((b, 1, c, 1, 1));

        let mut out = x
            .broadcast_mul(&per_channel(&self.scale)?)?
            .broadcast_add(&per_channel(&self.shift)?)?;
        out = out.broadcast_add(&per_sample(self.t_embed.forward(t)?)?)?;

        if let (Some(embed), Some(y)) = (&self.y_embed, cond) {
            out = out.broadcast_add(&per_sample(embed.forward(y)?)?)?;
        }
        Ok(out)
    }
}

/// Spatial average-pool encoder. Has no parameters.
#[derive(Debug, Clone, Copy)]
pub struct PooledFrameCompressor {
    factor: usize,
}

impl PooledFrameCompressor {
    #[must_use]
    pub fn new(factor: usize) -> Self {
        Self {
            factor: factor.max(1),
        }
    }
}

impl FrameCompressor for PooledFrameCompressor {
    fn encode(&self, frames: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = frames.dims4()?;
        if h % self.factor != 0 || w % self.factor != 0 {
            return Err(LatteError::MalformedBatch(format!(
                "frame size {h}x{w} is not divisible by {}",
                self.factor
            )));
        }
        Ok(frames.avg_pool2d(self.factor)?)
    }
}
