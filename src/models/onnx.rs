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

use std::{fs, path::PathBuf, sync::Arc};

use ndarray::{Array1, Array3, Array4, ArrayView3, ArrayView4, IxDyn};
use ort::{
	tensor::{FromArray, InputTensor, OrtOwnedTensor},
	Environment, ExecutionProvider, OrtResult, Session, SessionBuilder
};

use super::{ControlNet, ControlNetConfig, ControlNetResiduals, Denoiser, TextEncoder, Vae, DEFAULT_VAE_SCALING_FACTOR};
use crate::{
	config::{DiffusionFramework, DiffusionPipeline, RaveModelConfig},
	pipelines::RavePipeline
};

/// How ONNX Runtime grows a device's memory arena when an allocation exceeds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaExtendStrategy {
	/// Each extension doubles the previous one. Fewer, larger allocations.
	PowerOfTwo,
	/// Each extension covers exactly the requested amount. Slower, but keeps VRAM usage tight.
	SameAsRequested
}

impl Default for ArenaExtendStrategy {
	fn default() -> Self {
		Self::PowerOfTwo
	}
}

impl From<ArenaExtendStrategy> for String {
	fn from(strategy: ArenaExtendStrategy) -> Self {
		match strategy {
			ArenaExtendStrategy::PowerOfTwo => "kNextPowerOfTwo".to_string(),
			ArenaExtendStrategy::SameAsRequested => "kSameAsRequested".to_string()
		}
	}
}

/// Tuning knobs for the CUDA execution provider, mostly useful on low-VRAM GPUs.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct CUDADeviceOptions {
	/// Overrides the memory arena extension strategy for this session.
	pub arena_extend_strategy: Option<ArenaExtendStrategy>,
	/// Per-session memory limit in bytes. Without a limit a model may claim all available VRAM. Actual usage can
	/// exceed the limit slightly.
	pub memory_limit: Option<usize>
}

impl From<CUDADeviceOptions> for ExecutionProvider {
	fn from(options: CUDADeviceOptions) -> Self {
		let mut ep = ExecutionProvider::cuda();
		if let Some(strategy) = options.arena_extend_strategy {
			ep = ep.with("arena_extend_strategy", strategy);
		}
		if let Some(limit) = options.memory_limit {
			ep = ep.with("gpu_mem_limit", limit.to_string());
		}
		ep
	}
}

/// Where a model's ONNX Runtime session executes.
///
/// A model whose configured execution provider is unavailable at runtime falls back to the CPU.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DiffusionDevice {
	/// Execute on the CPU. This is the default.
	CPU,
	/// Execute on an NVIDIA GPU through CUDA. Takes the device ID (0 for single-GPU machines) and optional
	/// provider tuning.
	CUDA(usize, Option<CUDADeviceOptions>),
	/// Execute on an NVIDIA GPU through TensorRT.
	TensorRT,
	/// Execute on any other provider supported by ONNX Runtime. Untested providers may not work with all models.
	Custom(ExecutionProvider)
}

impl From<DiffusionDevice> for ExecutionProvider {
	fn from(device: DiffusionDevice) -> Self {
		match device {
			DiffusionDevice::CPU => ExecutionProvider::cpu(),
			DiffusionDevice::CUDA(device_id, options) => {
				let ep: ExecutionProvider = options.unwrap_or_default().into();
				ep.with("device_id", device_id.to_string())
			}
			DiffusionDevice::TensorRT => ExecutionProvider::tensorrt(),
			DiffusionDevice::Custom(ep) => ep
		}
	}
}

/// Per-model device placement.
///
/// The UNet and conditioning networks dominate inference cost, so on low-VRAM GPUs it can pay off to
/// keep only those on the GPU and leave the autoencoder on the CPU:
/// ```ignore
/// DiffusionDeviceControl {
/// 	unet: DiffusionDevice::CUDA(0, None),
/// 	controlnet: DiffusionDevice::CUDA(0, None),
/// 	..Default::default()
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DiffusionDeviceControl {
	/// Device for the variational autoencoder.
	pub vae: DiffusionDevice,
	/// Device for the UNet.
	pub unet: DiffusionDevice,
	/// Device shared by all conditioning networks.
	pub controlnet: DiffusionDevice
}

impl DiffusionDeviceControl {
	/// Places every model on the same device.
	pub fn all(device: DiffusionDevice) -> Self {
		Self {
			vae: device.clone(),
			unet: device.clone(),
			controlnet: device
		}
	}
}

impl Default for DiffusionDeviceControl {
	fn default() -> Self {
		DiffusionDeviceControl::all(DiffusionDevice::CPU)
	}
}

fn session(environment: &Arc<Environment>, path: PathBuf, device: DiffusionDevice) -> OrtResult<Session> {
	SessionBuilder::new(environment)?
		.with_execution_providers([device.into()])?
		.with_model_from_file(path)
}

fn extract<D: ndarray::Dimension>(output: &ort::tensor::DynOrtTensor<'_, IxDyn>) -> anyhow::Result<ndarray::Array<f32, D>> {
	let tensor: OrtOwnedTensor<'_, f32, IxDyn> = output.try_extract()?;
	Ok(tensor.view().to_owned().into_dimensionality()?)
}

/// A variational autoencoder backed by ONNX Runtime sessions.
pub struct OrtVae {
	encoder: Session,
	decoder: Session,
	scaling_factor: f32
}

impl OrtVae {
	/// Loads the encoder and decoder models from `encoder` and `decoder`, placing both on `device`.
	pub fn new(environment: &Arc<Environment>, encoder: impl Into<PathBuf>, decoder: impl Into<PathBuf>, device: DiffusionDevice) -> OrtResult<Self> {
		Ok(Self {
			encoder: session(environment, encoder.into(), device.clone())?,
			decoder: session(environment, decoder.into(), device)?,
			scaling_factor: DEFAULT_VAE_SCALING_FACTOR
		})
	}

	/// Overrides the latent scaling factor, for autoencoders not trained with the Stable Diffusion default.
	pub fn with_scaling_factor(mut self, scaling_factor: f32) -> Self {
		self.scaling_factor = scaling_factor;
		self
	}
}

impl Vae for OrtVae {
	fn encode(&self, images: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let outputs = self.encoder.run(vec![InputTensor::from_array(images.to_owned().into_dyn())])?;
		extract(&outputs[0])
	}

	fn decode(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let outputs = self.decoder.run(vec![InputTensor::from_array(latents.to_owned().into_dyn())])?;
		extract(&outputs[0])
	}

	fn scaling_factor(&self) -> f32 {
		self.scaling_factor
	}
}

/// A denoising UNet backed by an ONNX Runtime session.
///
/// The model is expected to take `(sample, timestep, encoder_hidden_states)` inputs, followed by the down-block
/// residuals and the mid-block residual when conditioning networks are attached (the layout produced by exporting a
/// `UNet2DConditionModel` with residual inputs).
pub struct OrtUNet {
	session: Session
}

impl OrtUNet {
	/// Loads the UNet model from `path`, placing it on `device`.
	pub fn new(environment: &Arc<Environment>, path: impl Into<PathBuf>, device: DiffusionDevice) -> OrtResult<Self> {
		Ok(Self {
			session: session(environment, path.into(), device)?
		})
	}
}

impl Denoiser for OrtUNet {
	fn predict_noise(
		&self,
		sample: ArrayView4<'_, f32>,
		timestep: f32,
		encoder_hidden_states: ArrayView3<'_, f32>,
		residuals: Option<&ControlNetResiduals>
	) -> anyhow::Result<Array4<f32>> {
		let mut inputs = vec![
			InputTensor::from_array(sample.to_owned().into_dyn()),
			InputTensor::from_array(Array1::from_iter([timestep]).into_dyn()),
			InputTensor::from_array(encoder_hidden_states.to_owned().into_dyn()),
		];
		if let Some(residuals) = residuals {
			for down in &residuals.down {
				inputs.push(InputTensor::from_array(down.clone()));
			}
			inputs.push(InputTensor::from_array(residuals.mid.clone()));
		}
		let outputs = self.session.run(inputs)?;
		extract(&outputs[0])
	}
}

/// A conditioning network backed by an ONNX Runtime session.
///
/// The model is expected to take `(sample, timestep, encoder_hidden_states, conditioning, conditioning_scale)`
/// inputs and produce the down-block residuals followed by the mid-block residual as its last output (the layout
/// produced by exporting a `ControlNetModel`).
pub struct OrtControlNet {
	session: Session
}

impl OrtControlNet {
	/// Loads the conditioning network from `path`, placing it on `device`.
	pub fn new(environment: &Arc<Environment>, path: impl Into<PathBuf>, device: DiffusionDevice) -> OrtResult<Self> {
		Ok(Self {
			session: session(environment, path.into(), device)?
		})
	}
}

impl ControlNet for OrtControlNet {
	fn predict_residuals(
		&self,
		sample: ArrayView4<'_, f32>,
		timestep: f32,
		encoder_hidden_states: ArrayView3<'_, f32>,
		conditioning: ArrayView4<'_, f32>,
		conditioning_scale: f32
	) -> anyhow::Result<ControlNetResiduals> {
		let outputs = self.session.run(vec![
			InputTensor::from_array(sample.to_owned().into_dyn()),
			InputTensor::from_array(Array1::from_iter([timestep]).into_dyn()),
			InputTensor::from_array(encoder_hidden_states.to_owned().into_dyn()),
			InputTensor::from_array(conditioning.to_owned().into_dyn()),
			InputTensor::from_array(Array1::from_iter([conditioning_scale]).into_dyn()),
		])?;
		if outputs.is_empty() {
			anyhow::bail!("conditioning network produced no outputs");
		}
		let mut down = Vec::with_capacity(outputs.len() - 1);
		for output in &outputs[..outputs.len() - 1] {
			down.push(extract(output)?);
		}
		let mid = extract(&outputs[outputs.len() - 1])?;
		Ok(ControlNetResiduals { down, mid })
	}
}

impl RavePipeline {
	/// Creates a pipeline with ONNX Runtime-backed models loaded from `root`, which must contain a
	/// `rave-diffusers.toml` model layout.
	///
	/// Text encoding is not covered by the model layout; supply a [`TextEncoder`] matching the UNet's conditioning
	/// space (e.g. a CLIP encoder with its tokenizer).
	pub fn from_model_dir(
		environment: &Arc<Environment>,
		root: impl Into<PathBuf>,
		devices: DiffusionDeviceControl,
		text_encoder: Box<dyn TextEncoder>
	) -> anyhow::Result<Self> {
		let root: PathBuf = root.into();
		let config: DiffusionPipeline = toml::from_str(&fs::read_to_string(root.join("rave-diffusers.toml"))?)?;
		let config: RaveModelConfig = match config {
			DiffusionPipeline::Rave { framework: DiffusionFramework::Onnx, inner } => inner,
			#[allow(unreachable_patterns)]
			_ => anyhow::bail!("not an ONNX video editing pipeline")
		};

		let mut vae = OrtVae::new(environment, root.join(&config.vae.encoder), root.join(&config.vae.decoder), devices.vae)?;
		if let Some(scaling_factor) = config.vae.scaling_factor {
			vae = vae.with_scaling_factor(scaling_factor);
		}
		let unet = OrtUNet::new(environment, root.join(&config.unet.path), devices.unet)?;
		let mut nets: Vec<Box<dyn ControlNet>> = Vec::with_capacity(config.controlnet.len());
		for entry in &config.controlnet {
			nets.push(Box::new(OrtControlNet::new(environment, root.join(&entry.path), devices.controlnet.clone())?));
		}

		Ok(RavePipeline::new(text_encoder, Box::new(vae), Box::new(unet), ControlNetConfig::Multiple(nets)))
	}
}
