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

use std::fmt::Debug;

use ndarray::{Array3, Array4};

use crate::Prompt;

pub mod conditioning;
mod denoise;
pub mod grid;
pub mod guidance;
mod impl_main;
pub mod shuffle;

pub use self::conditioning::ActivationWindow;
pub use self::impl_main::{RaveLatentOutput, RavePipeline};

/// How input frames are fitted to the pipeline's target size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePreprocessing {
	/// Stretch frames to the target size, ignoring aspect ratio.
	Resize,
	/// Scale frames to fill the target size, center-cropping the overflow.
	CropFill
}

/// Options for video editing. Video frames attend to each other within grids, and frames are shuffled between grids
/// on every denoising step, so edits stay consistent across the whole clip.
#[derive(Debug)]
pub struct RaveVideoOptions {
	/// The width each frame is resized to. Must be divisible by 8.
	pub(crate) width: u32,
	/// The height each frame is resized to. Must be divisible by 8.
	pub(crate) height: u32,
	/// The number of steps to take to edit the video.
	pub(crate) steps: usize,
	/// The 'guidance scale' for classifier-free guidance; a scale of 1.0 or below disables guidance entirely.
	pub(crate) guidance_scale: f32,
	/// How much the edit is allowed to deviate from the input video, in `(0, 1]`. Ignored (forced to 1.0) when an
	/// inversion stage is configured.
	pub(crate) strength: f32,
	/// The seed for noise and frame shuffling.
	pub(crate) seed: Option<u64>,
	/// Frames per grid row/column; each denoiser pass sees `grid_size²` frames.
	pub(crate) grid_size: u32,
	/// Whether to shuffle frames between grids on each step.
	pub(crate) use_shuffling: bool,
	/// How many grids the autoencoder processes per call.
	pub(crate) vae_batch_size: usize,
	/// How frames are fitted to `width`×`height`.
	pub(crate) preprocessing: FramePreprocessing,
	/// The editing prompt(s); one prompt shared by all grids, or one per grid.
	pub(crate) positive_prompt: Prompt,
	pub(crate) negative_prompt: Option<Prompt>,
	/// Precomputed text embeddings, mutually exclusive with `positive_prompt`.
	pub(crate) prompt_embeddings: Option<Array3<f32>>,
	pub(crate) negative_prompt_embeddings: Option<Array3<f32>>,
	/// Per-network conditioning strengths; a single value is shared by every attached network.
	pub(crate) controlnet_scales: Vec<f32>,
	/// Per-network activation windows; a single window is shared by every attached network.
	pub(crate) control_windows: Vec<ActivationWindow>,
	/// Optional latent inversion stage run before denoising.
	pub(crate) inversion: Option<InversionOptions>,
	/// Input video frames, normalized to `[-1, 1]`, NCHW.
	pub(crate) video: Array4<f32>,
	/// One conditioning video per attached network, normalized to `[0, 1]`, NCHW.
	pub(crate) control_videos: Vec<Array4<f32>>,
	/// Conditioning videos for the inversion stage; when empty, inversion reuses `control_videos`.
	pub(crate) inversion_control_videos: Vec<Array4<f32>>,
	pub(crate) callback: Option<RaveCallback>
}

/// Options for the latent inversion stage.
///
/// Inversion walks the clean video latents back up the noise schedule with an inverse scheduler instead of sampling
/// fresh Gaussian noise, which preserves much more of the input video's structure.
#[derive(Debug, Clone)]
pub struct InversionOptions {
	/// The prompt describing the *input* video (not the edit).
	pub positive_prompt: Prompt,
	/// An optional negative prompt for the inversion passes.
	pub negative_prompt: Option<Prompt>,
	/// The number of inversion steps.
	pub steps: usize
}

impl Default for InversionOptions {
	fn default() -> Self {
		Self {
			positive_prompt: Prompt::default(),
			negative_prompt: None,
			steps: 50
		}
	}
}

/// State replacements returned by a [`RaveCallback::StepEnd`] callback.
///
/// Fields left as `None` keep the loop's current state.
pub struct StepChange {
	/// Replacement latents for the next step, shaped like the current latents.
	pub latents: Option<Array4<f32>>,
	/// Replacement text embeddings for the remaining steps.
	pub prompt_embeddings: Option<Array3<f32>>,
	/// Set to `false` to stop the loop at this step boundary.
	pub keep_going: bool
}

impl StepChange {
	/// A step change that keeps all state and continues the loop.
	pub fn none() -> Self {
		StepChange { latents: None, prompt_embeddings: None, keep_going: true }
	}

	/// A step change that stops the loop at this step boundary.
	pub fn stop() -> Self {
		StepChange { latents: None, prompt_embeddings: None, keep_going: false }
	}
}

/// Describes a function to be called on each step of the pipeline.
pub enum RaveCallback {
	/// A simple callback to be used for e.g. reporting progress updates.
	Progress {
		/// Describes how frequently to call this callback (3 = every 3 steps).
		frequency: usize,
		/// Function Parameters:
		/// - **`step`** (usize): The current step number.
		/// - **`timestep`** (f32): This step's timestep.
		cb: Box<dyn Fn(usize, f32) -> bool>
	},
	/// A callback to receive this step's latents for previewing.
	Latents {
		/// Describes how frequently to call this callback (3 = every 3 steps).
		frequency: usize,
		/// Function Parameters:
		/// - **`step`** (usize): The current step number.
		/// - **`timestep`** (f32): This step's timestep.
		/// - **`latents`** (`Array4<f32>`): The scheduler's predicted fully-denoised latents when it computes them,
		///   otherwise this step's latent outputs; in grid layout.
		cb: Box<dyn Fn(usize, f32, Array4<f32>) -> bool>
	},
	/// A callback invoked at the end of each step which may replace parts of the loop state via [`StepChange`].
	StepEnd {
		/// Describes how frequently to call this callback (3 = every 3 steps).
		frequency: usize,
		/// Function Parameters:
		/// - **`step`** (usize): The current step number.
		/// - **`timestep`** (f32): This step's timestep.
		/// - **`latents`** (`Array4<f32>`): Scheduler latent outputs for this step, in grid layout.
		cb: Box<dyn Fn(usize, f32, Array4<f32>) -> StepChange>
	}
}

impl RaveCallback {
	/// How frequently the callback runs, in steps. Must be at least 1.
	pub(crate) fn frequency(&self) -> usize {
		match self {
			Self::Progress { frequency, .. } | Self::Latents { frequency, .. } | Self::StepEnd { frequency, .. } => *frequency
		}
	}
}

impl Debug for RaveCallback {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("<RaveCallback>")
	}
}
