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

//! `rave-diffusers` is a modular library for zero-shot video editing with diffusion models, using grid-based
//! denoising with randomized frame shuffling for temporal consistency.
//!
//! Video frames are tiled into grids so the denoiser's attention spans multiple frames at once, and frames are
//! shuffled between grids on every denoising step, spreading that consistency across the whole clip. Structure is
//! preserved through conditioning networks (e.g. edge or depth ControlNets) and, optionally, latent inversion.
//!
//! The pipeline is model-agnostic: the text encoder, autoencoder, denoiser and conditioning networks are reached
//! through the traits in [`models`], with ONNX Runtime-backed implementations available behind the `onnx` feature.
//!
//! ```ignore
//! use rave_diffusers::{DiffusionDeviceControl, OrtEnvironment, RavePipeline, RaveVideoOptions};
//!
//! let environment = OrtEnvironment::default().into_arc();
//! let pipeline = RavePipeline::from_model_dir(&environment, "./models/", DiffusionDeviceControl::default(), text_encoder)?;
//! let mut scheduler = make_scheduler();
//!
//! let frames = RaveVideoOptions::default()
//! 	.with_prompts("a wooden sailboat on rough seas", None::<&str>)
//! 	.with_video(&frames)
//! 	.with_control_videos(&[edge_maps])
//! 	.run(&pipeline, &mut scheduler, None)?;
//! ```
//!
//! See [`RaveVideoOptions`] for the full set of knobs.

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

cfg_if::cfg_if! {
	if #[cfg(feature = "onnx")] {
		pub(crate) mod config;
		pub use ort::Environment as OrtEnvironment;
	}
}

mod error;
pub mod models;
pub mod pipelines;
pub mod schedulers;

pub use self::error::DiffusersError;
pub use self::models::*;
pub use self::pipelines::*;
pub use self::schedulers::*;
