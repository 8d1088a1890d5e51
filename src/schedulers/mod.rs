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

//! The scheduler contract.
//!
//! A scheduler turns a model's noise prediction, the sample being iterated on and a timestep into the sample for the
//! previous timestep. This crate does not ship scheduler algorithms of its own; the denoising loops drive any type
//! implementing [`DiffusionScheduler`]. Forward schedules (DDIM, Euler, ...) and inverse schedules (for latent
//! inversion) use the same trait, an inversion schedule being simply one whose `timesteps` run from low to high
//! noise.
//!
//! A scheduler instance holds mutable per-run state (its computed timesteps, cached constants), so one instance must
//! never be shared between two overlapping pipeline invocations. The `&mut` receivers enforce this.

use ndarray::{Array4, ArrayBase, ArrayView1, ArrayView4};
use rand::RngCore;

/// What a scheduler's `step` produced for one timestep.
pub struct SchedulerStepOutput {
	pub(crate) prev_sample: Array4<f32>,
	pub(crate) pred_original_sample: Option<Array4<f32>>
}

impl SchedulerStepOutput {
	/// Creates a step output carrying only the previous sample.
	pub fn new(prev_sample: Array4<f32>) -> Self {
		Self { prev_sample, pred_original_sample: None }
	}

	/// Creates a step output carrying the previous sample and the predicted denoised sample.
	pub fn with_pred_original_sample(prev_sample: Array4<f32>, pred_original_sample: Array4<f32>) -> Self {
		Self {
			prev_sample,
			pred_original_sample: Some(pred_original_sample)
		}
	}

	/// The computed sample at the previous timestep (`x_{t-1}`), fed back into the model on the next step of the
	/// denoising loop.
	pub fn prev_sample(&self) -> ArrayView4<'_, f32> {
		self.prev_sample.view()
	}

	/// The fully denoised sample (`x_{0}`) as predicted from the current timestep's model output, when the scheduler
	/// computes one. Useful for previewing progress.
	pub fn pred_original_sample(&self) -> Option<ArrayView4<'_, f32>> {
		self.pred_original_sample.as_ref().map(ArrayBase::view)
	}
}

/// Drives the iterative denoising process of a diffusion pipeline.
///
/// The trait is object-safe so pipelines can drive a forward and an inverse schedule of different concrete types
/// through `&mut dyn DiffusionScheduler`.
pub trait DiffusionScheduler {
	/// Scales the denoising model input to match the scheduler's algorithm (e.g. by `(sigma**2 + 1) ** 0.5` for
	/// K-LMS-style schedulers). Schedulers that need no input scaling return the sample unchanged.
	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32>;

	/// Computes the timestep schedule (and any derived constants) for a run of `num_inference_steps` steps. Must be
	/// called before `step`.
	fn set_timesteps(&mut self, num_inference_steps: usize);

	/// Advances `sample` to the previous timestep given the model's output (usually the predicted noise) by
	/// reversing the diffusion SDE.
	///
	/// Stochastic schedulers draw from `rng`; deterministic schedulers ignore it.
	fn step(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>, rng: &mut dyn RngCore) -> SchedulerStepOutput;

	/// Adds noise to the given samples at the noise level of `timestep`.
	fn add_noise(&mut self, original_samples: ArrayView4<'_, f32>, noise: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32>;

	/// Returns the computed scheduler timesteps, ordered as the denoising loop should visit them.
	fn timesteps(&self) -> ArrayView1<'_, f32>;

	/// The solver order of this scheduler; higher-order schedulers consume multiple timesteps per output step.
	fn order(&self) -> usize {
		1
	}
}
