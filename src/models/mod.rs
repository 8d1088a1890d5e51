// Copyright 2024 rave-diffusers contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Model collaborator contracts.
//!
//! The pipelines in this crate never look inside a neural network; they submit tensors and receive tensors. Every
//! network is reached through one of the object-safe traits below, so a pipeline can run against ONNX Runtime
//! sessions (see the `onnx` feature) or against lightweight test doubles.
//!
//! All collaborator calls are synchronous and blocking from the loop's perspective; a collaborator is free to
//! parallelize internally. Errors (including accelerator resource exhaustion) propagate to the caller unmodified;
//! the pipelines never catch or retry them.

use ndarray::{Array3, Array4, ArrayD, ArrayView3, ArrayView4};

cfg_if::cfg_if! {
	if #[cfg(feature = "onnx")] {
		mod onnx;
		pub use self::onnx::*;
	}
}

/// Default scaling factor applied between pixel-space latent encodings and the denoiser's latent space, as used by
/// Stable Diffusion autoencoders.
pub const DEFAULT_VAE_SCALING_FACTOR: f32 = 0.18215;

/// A frozen text encoder (e.g. CLIP) producing hidden states used to condition the denoiser.
///
/// Tokenization is the implementor's concern; the pipeline passes raw prompt strings.
pub trait TextEncoder {
	/// Encodes a batch of prompts into hidden states of shape `(batch, sequence, dim)`.
	fn encode(&self, prompts: &[String]) -> anyhow::Result<Array3<f32>>;
}

/// A variational autoencoder mapping between pixel space and latent space.
pub trait Vae {
	/// Encodes a batch of images `(batch, 3, height, width)`, normalized to `[-1, 1]`, into latents.
	///
	/// Must be deterministic for a given instance; sampling autoencoders should use their distribution mode.
	fn encode(&self, images: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>>;

	/// Decodes a batch of latents back into `[-1, 1]` images.
	fn decode(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>>;

	/// The scaling factor between the encoder's output distribution and the denoiser's latent space.
	fn scaling_factor(&self) -> f32 {
		DEFAULT_VAE_SCALING_FACTOR
	}
}

/// Residual stacks produced by a [`ControlNet`], consumed by the denoiser's intermediate blocks.
#[derive(Debug, Clone)]
pub struct ControlNetResiduals {
	/// Per-down-block residuals, outermost first.
	pub down: Vec<ArrayD<f32>>,
	/// The mid-block residual.
	pub mid: ArrayD<f32>
}

impl ControlNetResiduals {
	/// Accumulates another network's residuals into this one, element-wise.
	///
	/// Multiple conditioning networks contribute additively to the same denoiser blocks, so their residual stacks
	/// must agree in arity and shape.
	pub(crate) fn accumulate(&mut self, other: &ControlNetResiduals) -> Result<(), crate::DiffusersError> {
		if self.down.len() != other.down.len() {
			return Err(crate::DiffusersError::shape(format!(
				"conditioning networks produced {} and {} down-block residuals",
				self.down.len(),
				other.down.len()
			)));
		}
		for (acc, r) in self.down.iter_mut().zip(other.down.iter()) {
			if acc.shape() != r.shape() {
				return Err(crate::DiffusersError::shape(format!(
					"down-block residual shapes differ between conditioning networks: {:?} vs {:?}",
					acc.shape(),
					r.shape()
				)));
			}
			*acc += r;
		}
		if self.mid.shape() != other.mid.shape() {
			return Err(crate::DiffusersError::shape(format!(
				"mid-block residual shapes differ between conditioning networks: {:?} vs {:?}",
				self.mid.shape(),
				other.mid.shape()
			)));
		}
		self.mid += &other.mid;
		Ok(())
	}
}

/// The denoising network (UNet).
pub trait Denoiser {
	/// Predicts the noise residual for `sample` at `timestep`.
	///
	/// `sample` holds the unconditional and conditional halves concatenated along the batch axis when classifier-free
	/// guidance is enabled, and the conditional batch alone otherwise. `residuals`, when present, are added into the
	/// network's intermediate blocks.
	fn predict_noise(
		&self,
		sample: ArrayView4<'_, f32>,
		timestep: f32,
		encoder_hidden_states: ArrayView3<'_, f32>,
		residuals: Option<&ControlNetResiduals>
	) -> anyhow::Result<Array4<f32>>;
}

/// An auxiliary conditioning network (ControlNet) producing residual guidance signals for the denoiser.
pub trait ControlNet {
	/// Predicts residuals for `sample` at `timestep`, steered by `conditioning` (e.g. edge maps, shape-aligned with
	/// the model input) and scaled by `conditioning_scale`.
	fn predict_residuals(
		&self,
		sample: ArrayView4<'_, f32>,
		timestep: f32,
		encoder_hidden_states: ArrayView3<'_, f32>,
		conditioning: ArrayView4<'_, f32>,
		conditioning_scale: f32
	) -> anyhow::Result<ControlNetResiduals>;
}

/// One or more conditioning networks attached to a pipeline.
///
/// Pipelines operate uniformly over the contained networks via [`ControlNetConfig::nets`]; a single network behaves
/// exactly like a one-element multi-network configuration.
pub enum ControlNetConfig {
	/// A single conditioning network.
	Single(Box<dyn ControlNet>),
	/// Multiple conditioning networks whose residuals are summed.
	Multiple(Vec<Box<dyn ControlNet>>)
}

impl ControlNetConfig {
	/// The attached networks as a uniform slice.
	pub fn nets(&self) -> &[Box<dyn ControlNet>] {
		match self {
			Self::Single(net) => std::slice::from_ref(net),
			Self::Multiple(nets) => nets.as_slice()
		}
	}

	/// The number of attached networks.
	pub fn len(&self) -> usize {
		self.nets().len()
	}

	/// Whether no networks are attached.
	pub fn is_empty(&self) -> bool {
		self.nets().is_empty()
	}
}
