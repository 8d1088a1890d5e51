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

use image::{imageops::FilterType, DynamicImage, Rgb32FImage};
use ndarray::{concatenate, Array3, Array4, ArrayView4, Axis};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rayon::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::denoise::{DenoiseConfig, DenoiseState};
use super::{conditioning::ActivationWindow, grid, shuffle, FramePreprocessing, InversionOptions, RaveCallback, RaveVideoOptions, StepChange};
use crate::models::{ControlNetConfig, Denoiser, TextEncoder, Vae};
use crate::schedulers::DiffusionScheduler;
use crate::{DiffusersError, Prompt};

/// A video editing pipeline using grid-based diffusion with randomized frame shuffling.
///
/// The pipeline holds its model collaborators behind trait objects, so it runs against any text encoder,
/// autoencoder, denoiser and conditioning networks (see [`crate::models`]). Per-run configuration lives in
/// [`RaveVideoOptions`]; the pipeline itself is immutable and can serve many runs.
pub struct RavePipeline {
	pub(crate) text_encoder: Box<dyn TextEncoder>,
	pub(crate) vae: Box<dyn Vae>,
	pub(crate) unet: Box<dyn Denoiser>,
	pub(crate) controlnet: ControlNetConfig
}

impl RavePipeline {
	/// Creates a pipeline from its model collaborators.
	pub fn new(text_encoder: Box<dyn TextEncoder>, vae: Box<dyn Vae>, unet: Box<dyn Denoiser>, controlnet: ControlNetConfig) -> Self {
		Self { text_encoder, vae, unet, controlnet }
	}

	/// Encodes positive (and, when guidance is enabled, negative) prompts into text embeddings, replicated to one
	/// entry per grid. When guidance is enabled the result holds `[unconditional; conditional]` along the batch axis.
	pub(crate) fn encode_prompt(
		&self,
		positive_prompt: &Prompt,
		negative_prompt: Option<&Prompt>,
		do_classifier_free_guidance: bool,
		batch_size: usize
	) -> anyhow::Result<Array3<f32>> {
		let positive = positive_prompt
			.replicate(batch_size)
			.ok_or_else(|| DiffusersError::validation(format!("expected 1 or {batch_size} prompts, got {}", positive_prompt.len())))?;
		let conditional = self.text_encoder.encode(&positive)?;
		if !do_classifier_free_guidance {
			return Ok(conditional);
		}

		let negative = match negative_prompt {
			Some(prompt) => prompt
				.replicate(batch_size)
				.ok_or_else(|| DiffusersError::validation(format!("expected 1 or {batch_size} negative prompts, got {}", prompt.len())))?,
			None => vec![String::new(); batch_size]
		};
		let unconditional = self.text_encoder.encode(&negative)?;
		if unconditional.shape() != conditional.shape() {
			return Err(DiffusersError::shape(format!(
				"negative embeddings of shape {:?} do not match positive embeddings of shape {:?}",
				unconditional.shape(),
				conditional.shape()
			))
			.into());
		}
		Ok(concatenate![Axis(0), unconditional, conditional])
	}

	/// Encodes pixel-space grids into latent grids, `batch_size` grids per autoencoder call.
	pub(crate) fn encode_grids(&self, grids: ArrayView4<'_, f32>, batch_size: usize) -> anyhow::Result<Array4<f32>> {
		let mut chunks = Vec::new();
		for chunk in grids.axis_chunks_iter(Axis(0), batch_size) {
			chunks.push(self.vae.encode(chunk)?);
		}
		let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
		let mut latents = concatenate(Axis(0), &views)?;
		latents *= self.vae.scaling_factor();
		Ok(latents)
	}

	/// Decodes latent grids back into pixel-space grids in `[-1, 1]`, `batch_size` grids per autoencoder call.
	pub fn decode_grid_latents(&self, latents: ArrayView4<'_, f32>, batch_size: usize) -> anyhow::Result<Array4<f32>> {
		let latents = latents.map(|f| f / self.vae.scaling_factor());
		let mut chunks = Vec::new();
		for chunk in latents.axis_chunks_iter(Axis(0), batch_size) {
			chunks.push(self.vae.decode(chunk)?);
		}
		let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
		Ok(concatenate(Axis(0), &views)?)
	}
}

/// The undecoded result of a run, for callers that post-process latents themselves.
pub struct RaveLatentOutput {
	/// Final latent grids. Frames inside the grids remain in their last shuffled slots.
	pub latents: Array4<f32>,
	/// Maps original frame index to the grid slot holding it; apply after unpacking to restore frame order.
	pub frame_order: Vec<usize>,
	/// The number of padding frames appended to fill the last grid.
	pub padded_frames: usize
}

impl Default for RaveVideoOptions {
	fn default() -> Self {
		Self {
			width: 512,
			height: 512,
			steps: 50,
			guidance_scale: 7.5,
			strength: 0.8,
			seed: None,
			grid_size: 2,
			use_shuffling: true,
			vae_batch_size: 1,
			preprocessing: FramePreprocessing::CropFill,
			positive_prompt: Prompt::default(),
			negative_prompt: None,
			prompt_embeddings: None,
			negative_prompt_embeddings: None,
			controlnet_scales: Vec::new(),
			control_windows: Vec::new(),
			inversion: None,
			video: Array4::zeros((0, 3, 0, 0)),
			control_videos: Vec::new(),
			inversion_control_videos: Vec::new(),
			callback: None
		}
	}
}

// builder for options
impl RaveVideoOptions {
	/// Set the size frames are fitted to. **Size will be rounded to a multiple of 8.** Any previously attached video
	/// is dropped, as it was preprocessed for the old size.
	pub fn with_size(self, width: u32, height: u32) -> Self {
		self.with_width(width).with_height(height)
	}
	/// Set the frame width. **Width will be rounded to a multiple of 8.**
	#[inline]
	pub fn with_width(mut self, width: u32) -> Self {
		self.width = (width / 8).max(1) * 8;
		self.drop_videos();
		self
	}
	/// Set the frame height. **Height will be rounded to a multiple of 8.**
	#[inline]
	pub fn with_height(mut self, height: u32) -> Self {
		self.height = (height / 8).max(1) * 8;
		self.drop_videos();
		self
	}
	#[inline(always)]
	fn drop_videos(&mut self) {
		self.video = Array4::zeros((0, 3, 0, 0));
		self.control_videos.clear();
		self.inversion_control_videos.clear();
	}
	/// The number of denoising steps. More steps typically yields a higher quality edit.
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = steps;
		self
	}
	/// The 'guidance scale' for classifier-free guidance. A lower guidance scale gives the model more freedom, but
	/// the output may not match the prompt; `7.5` is a good balance. A scale of 1.0 or below disables guidance and
	/// skips the unconditional passes entirely.
	pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
		self.guidance_scale = guidance_scale;
		self
	}
	/// How much the edit may deviate from the input video, in `(0, 1]`. Lower values start denoising later in the
	/// schedule and preserve more of the input. Ignored when an inversion stage is configured.
	pub fn with_strength(mut self, strength: f32) -> Self {
		self.strength = strength;
		self
	}
	/// Set the seed used for noise and frame shuffling, so that each run produces the same edit.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}
	/// Use a random seed, so that each run produces a different edit.
	pub fn with_random_seed(mut self) -> Self {
		self.seed = None;
		self
	}
	/// Frames per grid row/column. Each denoiser pass sees `grid_size²` frames attending to each other.
	pub fn with_grid_size(mut self, grid_size: u32) -> Self {
		self.grid_size = grid_size;
		self
	}
	/// Enable or disable shuffling frames between grids on each step. Disabling shuffling makes each grid independent
	/// and typically loses temporal consistency across grids.
	pub fn with_shuffling(mut self, use_shuffling: bool) -> Self {
		self.use_shuffling = use_shuffling;
		self
	}
	/// How many grids the autoencoder processes per call; lower values bound peak memory.
	pub fn with_vae_batch_size(mut self, vae_batch_size: usize) -> Self {
		self.vae_batch_size = vae_batch_size;
		self
	}
	/// How frames are fitted to the target size.
	pub fn with_preprocessing(mut self, preprocessing: FramePreprocessing) -> Self {
		self.preprocessing = preprocessing;
		self
	}
	/// Set the prompt(s) describing the edit: a single prompt shared by every grid, or one prompt per grid.
	pub fn with_prompts<P, N>(mut self, positive_prompt: P, negative_prompt: Option<N>) -> Self
	where
		P: Into<Prompt>,
		N: Into<Prompt>
	{
		self.positive_prompt = positive_prompt.into();
		self.negative_prompt = negative_prompt.map(|p| p.into());
		self
	}
	/// Supply precomputed text embeddings instead of prompts, one entry per grid. When guidance is enabled, negative
	/// embeddings of the same shape are required.
	pub fn with_prompt_embeddings(mut self, positive: Array3<f32>, negative: Option<Array3<f32>>) -> Self {
		self.prompt_embeddings = Some(positive);
		self.negative_prompt_embeddings = negative;
		self
	}
	/// Set the conditioning strength for every attached network.
	pub fn with_controlnet_scale(mut self, scale: f32) -> Self {
		self.controlnet_scales = vec![scale];
		self
	}
	/// Set per-network conditioning strengths, one per attached network.
	pub fn with_controlnet_scales(mut self, scales: Vec<f32>) -> Self {
		self.controlnet_scales = scales;
		self
	}
	/// Restrict every attached network to a fraction of the denoising schedule.
	pub fn with_control_window(mut self, window: ActivationWindow) -> Self {
		self.control_windows = vec![window];
		self
	}
	/// Set per-network activation windows, one per attached network.
	pub fn with_control_windows(mut self, windows: Vec<ActivationWindow>) -> Self {
		self.control_windows = windows;
		self
	}
	/// Run a latent inversion stage before denoising; requires an inverse scheduler to be passed to `run`.
	pub fn with_inversion(mut self, inversion: InversionOptions) -> Self {
		self.inversion = Some(inversion);
		self
	}
	/// Attach the video to edit. Frames are fitted to the configured size, so set the size first.
	pub fn with_video(mut self, frames: &[DynamicImage]) -> Self {
		self.video = self.frames_to_tensor(frames, true);
		self
	}
	/// Attach one conditioning video (e.g. edge or depth maps) per attached conditioning network. Each must have the
	/// same number of frames as the video.
	pub fn with_control_videos(mut self, videos: &[Vec<DynamicImage>]) -> Self {
		self.control_videos = videos.iter().map(|frames| self.frames_to_tensor(frames, false)).collect();
		self
	}
	/// Attach separate conditioning videos for the inversion stage; the inversion then conditions on these instead of
	/// reusing the edit's conditioning videos. Requires an inversion stage to be configured.
	pub fn with_inversion_control_videos(mut self, videos: &[Vec<DynamicImage>]) -> Self {
		self.inversion_control_videos = videos.iter().map(|frames| self.frames_to_tensor(frames, false)).collect();
		self
	}

	/// whc -> nchw; [0, 1], or [-1, 1] when `signed`
	fn frames_to_tensor(&self, frames: &[DynamicImage], signed: bool) -> Array4<f32> {
		let (width, height) = (self.width, self.height);
		let preprocessing = self.preprocessing;
		let frames: Vec<Rgb32FImage> = frames
			.par_iter()
			.map(|frame| {
				let frame = match preprocessing {
					FramePreprocessing::Resize => frame.resize_exact(width, height, FilterType::Lanczos3),
					FramePreprocessing::CropFill => frame.resize_to_fill(width, height, FilterType::Lanczos3)
				};
				frame.to_rgb32f()
			})
			.collect();
		Array4::from_shape_fn([frames.len(), 3, height as usize, width as usize], |(n, c, y, x)| {
			let value = frames[n].get_pixel(x as u32, y as u32).0[c];
			if signed { value * 2.0 - 1.0 } else { value }
		})
	}
}

// builder for callbacks
impl RaveVideoOptions {
	/// Calls `callback` every `frequency` steps with the step number and timestep, e.g. for reporting progress.
	/// Return `false` to stop the run at that step.
	pub fn callback_progress<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, f32) -> bool + 'static
	{
		self.callback = Some(RaveCallback::Progress { frequency, cb: Box::new(callback) });
		self
	}
	/// Calls `callback` every `frequency` steps with the step's latent grids (the scheduler's predicted fully-denoised
	/// latents when it computes them). Return `false` to stop the run at that step.
	pub fn callback_latents<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, f32, Array4<f32>) -> bool + 'static
	{
		self.callback = Some(RaveCallback::Latents { frequency, cb: Box::new(callback) });
		self
	}
	/// Calls `callback` every `frequency` steps; the returned [`StepChange`] may replace the latents or text
	/// embeddings for the remaining steps, or stop the run.
	pub fn callback_step_end<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, f32, Array4<f32>) -> StepChange + 'static
	{
		self.callback = Some(RaveCallback::StepEnd { frequency, cb: Box::new(callback) });
		self
	}
}

impl RaveVideoOptions {
	/// Edits the attached video according to the configured prompts and conditioning. Returns the edited frames in
	/// their original order, using float32 buffers; in most cases you'll want to convert them into RGB8 via
	/// `img.into_rgb8()`.
	///
	/// `scheduler` drives the denoising stage; `inverse_scheduler` must be supplied when an inversion stage is
	/// configured with [`RaveVideoOptions::with_inversion`].
	///
	/// # Examples
	///
	/// ```ignore
	/// let frames = RaveVideoOptions::default()
	/// 	.with_prompts("a wooden sailboat on rough seas", None::<&str>)
	/// 	.with_video(&load_frames())
	/// 	.with_control_videos(&[load_edge_maps()])
	/// 	.with_controlnet_scale(1.0)
	/// 	.with_seed(42)
	/// 	.run(&pipeline, &mut scheduler, None)?;
	/// ```
	pub fn run(
		&self,
		session: &RavePipeline,
		scheduler: &mut dyn DiffusionScheduler,
		inverse_scheduler: Option<&mut dyn DiffusionScheduler>
	) -> anyhow::Result<Vec<DynamicImage>> {
		let output = self.run_latents(session, scheduler, inverse_scheduler)?;
		let grids = session.decode_grid_latents(output.latents.view(), self.vae_batch_size)?;
		let frames = grid::unpack(grids.view(), self.grid_size)?;
		// restoring frame order also drops the padding frames, which occupy untracked slots
		let frames = shuffle::restore_frame_order(frames.view(), &output.frame_order);
		tracing::info!(frames = frames.shape()[0], "decoded edited video");
		Ok(tensor_to_images(frames.view()))
	}

	/// Edits the attached video like [`RaveVideoOptions::run`], but returns the final latent grids without decoding.
	pub fn run_latents(
		&self,
		session: &RavePipeline,
		scheduler: &mut dyn DiffusionScheduler,
		inverse_scheduler: Option<&mut dyn DiffusionScheduler>
	) -> anyhow::Result<RaveLatentOutput> {
		self.check_inputs(session, inverse_scheduler.is_some())?;

		let seed = self.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>());
		let mut rng = StdRng::seed_from_u64(seed);

		let num_frames = self.video.shape()[0];
		let (video, padded_frames) = grid::pad_to_grid(self.video.view(), self.grid_size);
		let video_grids = grid::pack(video.view(), self.grid_size)?;
		let controls = self
			.control_videos
			.iter()
			.map(|control| {
				let (control, _) = grid::pad_to_grid(control.view(), self.grid_size);
				grid::pack(control.view(), self.grid_size)
			})
			.collect::<Result<Vec<_>, _>>()?;

		let num_grids = video_grids.shape()[0];
		let do_classifier_free_guidance = super::guidance::guidance_enabled(self.guidance_scale);
		tracing::info!(num_frames, num_grids, grid_size = self.grid_size, seed, "starting video edit");

		let text_embeddings = match self.prompt_embeddings.as_ref() {
			Some(positive) => match (do_classifier_free_guidance, self.negative_prompt_embeddings.as_ref()) {
				(true, Some(negative)) => concatenate![Axis(0), negative.view(), positive.view()],
				(true, None) => unreachable!("validated in check_inputs"),
				(false, _) => positive.clone()
			},
			None => session.encode_prompt(&self.positive_prompt, self.negative_prompt.as_ref(), do_classifier_free_guidance, num_grids)?
		};

		let strength = if self.inversion.is_some() { 1.0 } else { self.strength };
		scheduler.set_timesteps(self.steps);
		let order = scheduler.order();
		let t_start = self.steps.saturating_sub((self.steps as f32 * strength) as usize);
		let timesteps: Vec<f32> = scheduler.timesteps().iter().skip(t_start * order).copied().collect();
		if timesteps.is_empty() {
			return Err(DiffusersError::validation(format!("strength {strength} with {} steps leaves no denoising steps", self.steps)).into());
		}

		let mut latents = session.encode_grids(video_grids.view(), self.vae_batch_size)?;
		if let Some(inversion) = self.inversion.as_ref() {
			let inverse_scheduler = match inverse_scheduler {
				Some(scheduler) => scheduler,
				None => unreachable!("validated in check_inputs")
			};
			let inversion_controls = if self.inversion_control_videos.is_empty() {
				controls.clone()
			} else {
				self.inversion_control_videos
					.iter()
					.map(|control| {
						let (control, _) = grid::pad_to_grid(control.view(), self.grid_size);
						grid::pack(control.view(), self.grid_size)
					})
					.collect::<Result<Vec<_>, _>>()?
			};
			latents = self.invert_latents(session, inverse_scheduler, inversion, latents, &inversion_controls, do_classifier_free_guidance, &mut rng)?;
		} else {
			let shape = latents.raw_dim();
			let noise = Array4::<f32>::random_using(shape, StandardNormal, &mut rng);
			latents = scheduler.add_noise(latents.view(), noise.view(), timesteps[0]);
		}

		let state = DenoiseState {
			latents,
			controls,
			text_embeddings,
			frame_order: (0..num_frames).collect()
		};
		let controlnet_scales = self.resolved_scales(session);
		let control_windows = self.resolved_windows(session);
		let config = DenoiseConfig {
			guidance_scale: self.guidance_scale,
			use_shuffling: self.use_shuffling,
			grid_size: self.grid_size,
			controlnet_scales: &controlnet_scales,
			control_windows: &control_windows,
			callback: self.callback.as_ref()
		};
		let state = session.denoise_loop(scheduler, &timesteps, &config, state, &mut rng)?;

		Ok(RaveLatentOutput {
			latents: state.latents,
			frame_order: state.frame_order,
			padded_frames
		})
	}

	/// Walks the clean latents up the noise schedule with the inverse scheduler, replacing Gaussian initialization.
	/// Shuffling stays off here so the inversion trajectory of each grid is self-contained.
	fn invert_latents(
		&self,
		session: &RavePipeline,
		inverse_scheduler: &mut dyn DiffusionScheduler,
		inversion: &InversionOptions,
		latents: Array4<f32>,
		controls: &[Array4<f32>],
		do_classifier_free_guidance: bool,
		rng: &mut StdRng
	) -> anyhow::Result<Array4<f32>> {
		let num_grids = latents.shape()[0];
		tracing::info!(steps = inversion.steps, "inverting latents");

		let text_embeddings = session.encode_prompt(&inversion.positive_prompt, inversion.negative_prompt.as_ref(), do_classifier_free_guidance, num_grids)?;

		inverse_scheduler.set_timesteps(inversion.steps);
		let timesteps: Vec<f32> = inverse_scheduler.timesteps().iter().copied().collect();

		let state = DenoiseState {
			latents,
			controls: controls.to_vec(),
			text_embeddings,
			frame_order: Vec::new()
		};
		let controlnet_scales = self.resolved_scales(session);
		let control_windows = self.resolved_windows(session);
		let config = DenoiseConfig {
			guidance_scale: self.guidance_scale,
			use_shuffling: false,
			grid_size: self.grid_size,
			controlnet_scales: &controlnet_scales,
			control_windows: &control_windows,
			callback: None
		};
		let state = session.denoise_loop(inverse_scheduler, &timesteps, &config, state, rng)?;
		Ok(state.latents)
	}

	/// One conditioning scale per attached network; a single configured scale (or `1.0` when unset) is shared by all
	/// of them.
	fn resolved_scales(&self, session: &RavePipeline) -> Vec<f32> {
		let nets = session.controlnet.len();
		match self.controlnet_scales.len() {
			0 => vec![1.0; nets],
			1 => vec![self.controlnet_scales[0]; nets],
			_ => self.controlnet_scales.clone()
		}
	}

	/// One activation window per attached network; a single configured window (or none) is shared by all of them.
	fn resolved_windows(&self, session: &RavePipeline) -> Vec<ActivationWindow> {
		let nets = session.controlnet.len();
		match self.control_windows.len() {
			0 => vec![ActivationWindow::default(); nets],
			1 => vec![self.control_windows[0]; nets],
			_ => self.control_windows.clone()
		}
	}

	/// Validates the full option set against the pipeline before any model is invoked.
	fn check_inputs(&self, session: &RavePipeline, has_inverse_scheduler: bool) -> Result<(), DiffusersError> {
		if self.width == 0 || self.height == 0 || self.width % 8 != 0 || self.height % 8 != 0 {
			return Err(DiffusersError::validation(format!(
				"`width` ({}) and `height` ({}) must be nonzero and divisible by 8",
				self.width, self.height
			)));
		}
		if self.grid_size == 0 {
			return Err(DiffusersError::validation("`grid_size` must be at least 1"));
		}
		if self.steps == 0 {
			return Err(DiffusersError::validation("`steps` must be at least 1"));
		}
		if self.vae_batch_size == 0 {
			return Err(DiffusersError::validation("`vae_batch_size` must be at least 1"));
		}
		if !(0.0..=1.0).contains(&self.strength) || self.strength == 0.0 {
			return Err(DiffusersError::validation(format!("`strength` ({}) must be in (0, 1]", self.strength)));
		}
		if let Some(callback) = self.callback.as_ref() {
			if callback.frequency() == 0 {
				return Err(DiffusersError::validation("callback `frequency` must be at least 1"));
			}
		}

		let num_frames = self.video.shape()[0];
		if num_frames == 0 {
			return Err(DiffusersError::validation("no video attached; call `with_video` after setting the size"));
		}

		let nets = session.controlnet.len();
		if self.control_videos.len() != nets {
			return Err(DiffusersError::validation(format!(
				"{} conditioning video(s) attached but the pipeline has {nets} conditioning network(s)",
				self.control_videos.len()
			)));
		}
		for (i, control) in self.control_videos.iter().enumerate() {
			if control.shape()[0] != num_frames {
				return Err(DiffusersError::validation(format!(
					"conditioning video {i} has {} frames but the video has {num_frames}",
					control.shape()[0]
				)));
			}
		}
		if !self.inversion_control_videos.is_empty() {
			if self.inversion.is_none() {
				return Err(DiffusersError::validation("inversion conditioning videos are attached but no inversion stage is configured"));
			}
			if self.inversion_control_videos.len() != nets {
				return Err(DiffusersError::validation(format!(
					"{} inversion conditioning video(s) attached but the pipeline has {nets} conditioning network(s)",
					self.inversion_control_videos.len()
				)));
			}
			for (i, control) in self.inversion_control_videos.iter().enumerate() {
				if control.shape()[0] != num_frames {
					return Err(DiffusersError::validation(format!(
						"inversion conditioning video {i} has {} frames but the video has {num_frames}",
						control.shape()[0]
					)));
				}
			}
		}
		if !matches!(self.controlnet_scales.len(), 0 | 1) && self.controlnet_scales.len() != nets {
			return Err(DiffusersError::validation(format!(
				"expected 0, 1 or {nets} conditioning scale(s), got {}",
				self.controlnet_scales.len()
			)));
		}
		if !matches!(self.control_windows.len(), 0 | 1) && self.control_windows.len() != nets {
			return Err(DiffusersError::validation(format!(
				"expected 0, 1 or {nets} activation window(s), got {}",
				self.control_windows.len()
			)));
		}
		for window in &self.control_windows {
			window.validate()?;
		}

		let per_grid = (self.grid_size * self.grid_size) as usize;
		let num_grids = (num_frames + per_grid - 1) / per_grid;
		match (self.positive_prompt.is_empty(), self.prompt_embeddings.as_ref()) {
			(false, Some(_)) => return Err(DiffusersError::validation("`with_prompts` and `with_prompt_embeddings` are mutually exclusive")),
			(true, None) => return Err(DiffusersError::validation("either prompts or prompt embeddings must be supplied")),
			(true, Some(embeddings)) => {
				if embeddings.shape()[0] != num_grids {
					return Err(DiffusersError::validation(format!(
						"prompt embeddings hold {} entries but the video packs into {num_grids} grid(s)",
						embeddings.shape()[0]
					)));
				}
				if super::guidance::guidance_enabled(self.guidance_scale) {
					match self.negative_prompt_embeddings.as_ref() {
						Some(negative) if negative.shape() == embeddings.shape() => {}
						Some(negative) => {
							return Err(DiffusersError::validation(format!(
								"negative embeddings of shape {:?} do not match positive embeddings of shape {:?}",
								negative.shape(),
								embeddings.shape()
							)));
						}
						None => return Err(DiffusersError::validation("negative prompt embeddings are required when guidance is enabled"))
					}
				}
			}
			(false, None) => {
				if self.positive_prompt.len() != 1 && self.positive_prompt.len() != num_grids {
					return Err(DiffusersError::validation(format!(
						"expected 1 or {num_grids} prompt(s), got {}",
						self.positive_prompt.len()
					)));
				}
				if let Some(negative) = self.negative_prompt.as_ref() {
					if negative.len() != 1 && negative.len() != num_grids {
						return Err(DiffusersError::validation(format!("expected 1 or {num_grids} negative prompt(s), got {}", negative.len())));
					}
				}
			}
		}

		if let Some(inversion) = self.inversion.as_ref() {
			if !has_inverse_scheduler {
				return Err(DiffusersError::validation("an inversion stage is configured but no inverse scheduler was supplied"));
			}
			if inversion.steps == 0 {
				return Err(DiffusersError::validation("inversion `steps` must be at least 1"));
			}
			if inversion.positive_prompt.is_empty() {
				return Err(DiffusersError::validation("inversion requires a prompt describing the input video"));
			}
		}

		Ok(())
	}
}

/// nchw, [-1, 1] -> float32 images
fn tensor_to_images(frames: ArrayView4<'_, f32>) -> Vec<DynamicImage> {
	let (n, height, width) = (frames.shape()[0], frames.shape()[2], frames.shape()[3]);
	(0..n)
		.map(|i| {
			let image = Rgb32FImage::from_fn(width as u32, height as u32, |x, y| {
				let pixel = |c: usize| (frames[[i, c, y as usize, x as usize]] / 2.0 + 0.5).clamp(0.0, 1.0);
				image::Rgb([pixel(0), pixel(1), pixel(2)])
			});
			DynamicImage::ImageRgb32F(image)
		})
		.collect()
}
