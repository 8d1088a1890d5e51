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

use ndarray::{concatenate, Array3, Array4, Axis};
use rand::rngs::StdRng;

use super::{conditioning, guidance, shuffle, ActivationWindow, RaveCallback, RavePipeline};
use crate::models::ControlNetResiduals;
use crate::schedulers::DiffusionScheduler;
use crate::DiffusersError;

/// Per-invocation knobs for the denoising loop, resolved from [`super::RaveVideoOptions`] by the controller.
///
/// `controlnet_scales` and `control_windows` are already expanded to one entry per attached network.
pub(crate) struct DenoiseConfig<'a> {
	pub guidance_scale: f32,
	pub use_shuffling: bool,
	pub grid_size: u32,
	pub controlnet_scales: &'a [f32],
	pub control_windows: &'a [ActivationWindow],
	pub callback: Option<&'a RaveCallback>
}

/// The state threaded through the denoising loop.
pub(crate) struct DenoiseState {
	/// Latent grids, `(num_grids, c, lh, lw)`.
	pub latents: Array4<f32>,
	/// One pixel-space conditioning grid batch per attached network, shuffled in lockstep with `latents`.
	pub controls: Vec<Array4<f32>>,
	/// Text embeddings; `[unconditional; conditional]` concatenated along the batch axis when guidance is enabled.
	pub text_embeddings: Array3<f32>,
	/// `frame_order[i]` = grid slot currently holding original frame `i`.
	pub frame_order: Vec<usize>
}

impl RavePipeline {
	/// Runs the denoising loop over `timesteps`, returning the final state.
	///
	/// Steps are strictly sequential. Each step shuffles frames between grids (when enabled), predicts noise with
	/// conditioning residuals, combines guidance, and advances the scheduler. The callback runs at step boundaries
	/// and may stop the loop early.
	pub(crate) fn denoise_loop(
		&self,
		scheduler: &mut dyn DiffusionScheduler,
		timesteps: &[f32],
		config: &DenoiseConfig<'_>,
		mut state: DenoiseState,
		rng: &mut StdRng
	) -> anyhow::Result<DenoiseState> {
		let num_grids = state.latents.shape()[0];
		for (i, control) in state.controls.iter().enumerate() {
			if control.shape()[0] != num_grids {
				return Err(DiffusersError::shape(format!(
					"conditioning tensor {} holds {} grids but the latents hold {num_grids}",
					i,
					control.shape()[0]
				))
				.into());
			}
		}

		let do_classifier_free_guidance = guidance::guidance_enabled(config.guidance_scale);
		let total_steps = timesteps.len();
		let keep_table = conditioning::keep_schedule(total_steps, config.control_windows);
		let order = scheduler.order();

		tracing::debug!(steps = total_steps, num_grids, shuffling = config.use_shuffling, "starting denoising loop");

		for (i, &t) in timesteps.iter().enumerate() {
			if config.use_shuffling {
				let permutation = shuffle::generate_permutation(state.frame_order.len(), rng);
				let (latents, controls) = shuffle::shuffle_grids(state.latents.view(), &state.controls, &mut state.frame_order, &permutation, config.grid_size)?;
				state.latents = latents;
				state.controls = controls;
			}

			let latent_model_input = if do_classifier_free_guidance {
				concatenate![Axis(0), state.latents, state.latents]
			} else {
				state.latents.clone()
			};
			let latent_model_input = scheduler.scale_model_input(latent_model_input.view(), t);

			let keep = &keep_table[i];
			let mut residuals: Option<ControlNetResiduals> = None;
			for (j, net) in self.controlnet.nets().iter().enumerate() {
				// a gated-off network still runs with scale 0: the denoiser must receive the same set of
				// residual inputs on every step
				let scale = config.controlnet_scales[j] * keep[j];
				let conditioning = if do_classifier_free_guidance {
					concatenate![Axis(0), state.controls[j], state.controls[j]]
				} else {
					state.controls[j].clone()
				};
				let net_residuals = net.predict_residuals(latent_model_input.view(), t, state.text_embeddings.view(), conditioning.view(), scale)?;
				match residuals.as_mut() {
					Some(acc) => acc.accumulate(&net_residuals)?,
					None => residuals = Some(net_residuals)
				}
			}

			let noise_pred = self.unet.predict_noise(latent_model_input.view(), t, state.text_embeddings.view(), residuals.as_ref())?;
			let noise_pred = if do_classifier_free_guidance {
				guidance::split_and_combine(noise_pred.view(), config.guidance_scale)?
			} else {
				noise_pred
			};

			let scheduler_output = scheduler.step(noise_pred.view(), t, state.latents.view(), rng);
			let pred_original_sample = scheduler_output.pred_original_sample;
			state.latents = scheduler_output.prev_sample;

			tracing::trace!(step = i, timestep = t, "denoising step complete");

			if let Some(callback) = config.callback {
				if i == total_steps - 1 || (i + 1) % order == 0 {
					let keep_going = match callback {
						RaveCallback::Progress { frequency, cb } if i % frequency == 0 => cb(i, t),
						// schedulers that predict x_0 expose it for previews; fall back to the stepped sample
						RaveCallback::Latents { frequency, cb } if i % frequency == 0 => {
							cb(i, t, pred_original_sample.unwrap_or_else(|| state.latents.clone()))
						}
						RaveCallback::StepEnd { frequency, cb } if i % frequency == 0 => {
							let change = cb(i, t, state.latents.clone());
							if let Some(latents) = change.latents {
								if latents.shape() != state.latents.shape() {
									return Err(DiffusersError::shape(format!(
										"callback replaced latents of shape {:?} with shape {:?}",
										state.latents.shape(),
										latents.shape()
									))
									.into());
								}
								state.latents = latents;
							}
							if let Some(embeddings) = change.prompt_embeddings {
								state.text_embeddings = embeddings;
							}
							change.keep_going
						}
						_ => true
					};
					if !keep_going {
						tracing::debug!(step = i, "denoising loop stopped by callback");
						break;
					}
				}
			}
		}

		Ok(state)
	}
}
