use std::cell::{Cell, RefCell};
use std::rc::Rc;

use image::{DynamicImage, Rgb32FImage};
use ndarray::{Array1, Array3, Array4, ArrayView1, ArrayView3, ArrayView4};
use rand::{Rng, RngCore};
use rave_diffusers::{
	ActivationWindow, ControlNet, ControlNetConfig, ControlNetResiduals, Denoiser, DiffusersError, DiffusionScheduler, InversionOptions, RavePipeline,
	RaveVideoOptions, SchedulerStepOutput, StepChange, TextEncoder, Vae
};

#[derive(Default)]
struct MockTextEncoder {
	calls: Rc<Cell<usize>>
}

impl TextEncoder for MockTextEncoder {
	fn encode(&self, prompts: &[String]) -> anyhow::Result<Array3<f32>> {
		self.calls.set(self.calls.get() + 1);
		Ok(Array3::from_shape_fn((prompts.len(), 2, 4), |(b, s, d)| {
			let sum: u32 = prompts[b].bytes().map(u32::from).sum();
			(sum as f32) * 0.001 + (s * 4 + d) as f32
		}))
	}
}

/// Passes pixels through unchanged so the full pipeline is an exact round trip.
struct IdentityVae;

impl Vae for IdentityVae {
	fn encode(&self, images: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		Ok(images.to_owned())
	}

	fn decode(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		Ok(latents.to_owned())
	}

	fn scaling_factor(&self) -> f32 {
		1.0
	}
}

#[derive(Default)]
struct ZeroDenoiser {
	calls: Rc<Cell<usize>>,
	batches: Rc<RefCell<Vec<usize>>>,
	saw_residuals: Rc<RefCell<Vec<bool>>>
}

impl Denoiser for ZeroDenoiser {
	fn predict_noise(
		&self,
		sample: ArrayView4<'_, f32>,
		_timestep: f32,
		_encoder_hidden_states: ArrayView3<'_, f32>,
		residuals: Option<&ControlNetResiduals>
	) -> anyhow::Result<Array4<f32>> {
		self.calls.set(self.calls.get() + 1);
		self.batches.borrow_mut().push(sample.shape()[0]);
		self.saw_residuals.borrow_mut().push(residuals.is_some());
		Ok(Array4::zeros(sample.raw_dim()))
	}
}

#[derive(Default)]
struct CountingControlNet {
	calls: Rc<Cell<usize>>,
	scales: Rc<RefCell<Vec<f32>>>,
	conditioning_seen: Rc<RefCell<Vec<f32>>>
}

impl ControlNet for CountingControlNet {
	fn predict_residuals(
		&self,
		sample: ArrayView4<'_, f32>,
		_timestep: f32,
		_encoder_hidden_states: ArrayView3<'_, f32>,
		conditioning: ArrayView4<'_, f32>,
		conditioning_scale: f32
	) -> anyhow::Result<ControlNetResiduals> {
		assert_eq!(sample.shape()[0], conditioning.shape()[0]);
		self.calls.set(self.calls.get() + 1);
		self.scales.borrow_mut().push(conditioning_scale);
		self.conditioning_seen.borrow_mut().push(conditioning[[0, 0, 0, 0]]);
		Ok(ControlNetResiduals {
			down: vec![Array4::<f32>::zeros((1, 1, 1, 1)).into_dyn()],
			mid: Array4::<f32>::zeros((1, 1, 1, 1)).into_dyn()
		})
	}
}

/// Linear timesteps; `step` passes the sample through, optionally perturbed by the run's RNG.
struct MockScheduler {
	timesteps: Array1<f32>,
	ascending: bool,
	stochastic: bool,
	predicts_original: bool
}

impl MockScheduler {
	fn new() -> Self {
		Self {
			timesteps: Array1::zeros(0),
			ascending: false,
			stochastic: false,
			predicts_original: false
		}
	}

	fn stochastic() -> Self {
		Self { stochastic: true, ..Self::new() }
	}

	fn inverse() -> Self {
		Self { ascending: true, ..Self::new() }
	}

	fn predicting_original() -> Self {
		Self { predicts_original: true, ..Self::new() }
	}
}

impl DiffusionScheduler for MockScheduler {
	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, _timestep: f32) -> Array4<f32> {
		sample.to_owned()
	}

	fn set_timesteps(&mut self, num_inference_steps: usize) {
		let steps: Vec<f32> = (0..num_inference_steps).map(|i| i as f32).collect();
		self.timesteps = if self.ascending {
			Array1::from_vec(steps)
		} else {
			Array1::from_vec(steps.into_iter().rev().collect())
		};
	}

	fn step(&mut self, _model_output: ArrayView4<'_, f32>, _timestep: f32, sample: ArrayView4<'_, f32>, rng: &mut dyn RngCore) -> SchedulerStepOutput {
		let mut prev = sample.to_owned();
		if self.stochastic {
			prev.mapv_inplace(|v| v + rng.gen::<f32>() * 1e-3);
		}
		if self.predicts_original {
			let pred = Array4::from_elem(prev.raw_dim(), 7.0);
			SchedulerStepOutput::with_pred_original_sample(prev, pred)
		} else {
			SchedulerStepOutput::new(prev)
		}
	}

	fn add_noise(&mut self, original_samples: ArrayView4<'_, f32>, _noise: ArrayView4<'_, f32>, _timestep: f32) -> Array4<f32> {
		original_samples.to_owned()
	}

	fn timesteps(&self) -> ArrayView1<'_, f32> {
		self.timesteps.view()
	}
}

fn test_frames(n: usize, size: u32) -> Vec<DynamicImage> {
	(0..n)
		.map(|i| {
			DynamicImage::ImageRgb32F(Rgb32FImage::from_fn(size, size, |x, y| {
				let v = ((i * 31 + x as usize * 7 + y as usize) % 256) as f32 / 255.0;
				image::Rgb([v, v * 0.5, 1.0 - v])
			}))
		})
		.collect()
}

fn pipeline_without_controlnet() -> RavePipeline {
	RavePipeline::new(
		Box::new(MockTextEncoder::default()),
		Box::new(IdentityVae),
		Box::new(ZeroDenoiser::default()),
		ControlNetConfig::Multiple(Vec::new())
	)
}

fn raw_pixels(images: &[DynamicImage]) -> Vec<Vec<f32>> {
	images.iter().map(|img| img.to_rgb32f().into_raw()).collect()
}

fn base_options(frames: &[DynamicImage]) -> RaveVideoOptions {
	RaveVideoOptions::default()
		.with_size(32, 32)
		.with_steps(10)
		.with_strength(1.0)
		.with_grid_size(2)
		.with_seed(42)
		.with_prompts("a watercolor painting", None::<&str>)
		.with_video(frames)
}

#[test]
fn shuffling_restores_frame_order() {
	let frames = test_frames(8, 32);
	let pipeline = pipeline_without_controlnet();

	// the mocks pass latents through untouched, so a run with shuffling must produce exactly the frames a run
	// without shuffling does, in the same order
	let shuffled = base_options(&frames).run(&pipeline, &mut MockScheduler::new(), None).unwrap();
	let ordered = base_options(&frames).with_shuffling(false).run(&pipeline, &mut MockScheduler::new(), None).unwrap();

	assert_eq!(shuffled.len(), frames.len());
	assert_eq!(raw_pixels(&shuffled), raw_pixels(&ordered));
}

#[test]
fn frame_order_tracks_shuffling() {
	let frames = test_frames(8, 32);
	let pipeline = pipeline_without_controlnet();

	let output = base_options(&frames).run_latents(&pipeline, &mut MockScheduler::new(), None).unwrap();
	assert_ne!(output.frame_order, (0..8).collect::<Vec<_>>());

	let output = base_options(&frames)
		.with_shuffling(false)
		.run_latents(&pipeline, &mut MockScheduler::new(), None)
		.unwrap();
	assert_eq!(output.frame_order, (0..8).collect::<Vec<_>>());
}

#[test]
fn padding_fills_partial_grids() {
	let frames = test_frames(6, 32);
	let pipeline = pipeline_without_controlnet();

	let output = base_options(&frames).run_latents(&pipeline, &mut MockScheduler::new(), None).unwrap();
	assert_eq!(output.padded_frames, 2);
	assert_eq!(output.latents.shape()[0], 2);

	let images = base_options(&frames).run(&pipeline, &mut MockScheduler::new(), None).unwrap();
	assert_eq!(images.len(), 6);
}

#[test]
fn deterministic_for_fixed_seed() {
	let frames = test_frames(8, 32);
	let pipeline = pipeline_without_controlnet();

	let a = base_options(&frames).run(&pipeline, &mut MockScheduler::stochastic(), None).unwrap();
	let b = base_options(&frames).run(&pipeline, &mut MockScheduler::stochastic(), None).unwrap();
	assert_eq!(raw_pixels(&a), raw_pixels(&b));

	let c = base_options(&frames).with_seed(43).run(&pipeline, &mut MockScheduler::stochastic(), None).unwrap();
	assert_ne!(raw_pixels(&a), raw_pixels(&c));
}

#[test]
fn validation_runs_before_any_model_call() {
	let frames = test_frames(8, 32);
	let controlnet_calls = Rc::new(Cell::new(0));
	let denoiser_calls = Rc::new(Cell::new(0));
	let encoder_calls = Rc::new(Cell::new(0));
	let pipeline = RavePipeline::new(
		Box::new(MockTextEncoder { calls: encoder_calls.clone() }),
		Box::new(IdentityVae),
		Box::new(ZeroDenoiser {
			calls: denoiser_calls.clone(),
			..ZeroDenoiser::default()
		}),
		ControlNetConfig::Single(Box::new(CountingControlNet {
			calls: controlnet_calls.clone(),
			..CountingControlNet::default()
		}))
	);

	// conditioning video has the wrong frame count
	let controls = test_frames(5, 32);
	let err = base_options(&frames)
		.with_control_videos(&[controls])
		.run(&pipeline, &mut MockScheduler::new(), None)
		.unwrap_err();
	assert!(matches!(err.downcast_ref::<DiffusersError>(), Some(DiffusersError::Validation(_))));
	assert_eq!(encoder_calls.get(), 0);
	assert_eq!(denoiser_calls.get(), 0);
	assert_eq!(controlnet_calls.get(), 0);
}

#[test]
fn rejects_invalid_option_combinations() {
	let frames = test_frames(8, 32);
	let pipeline = pipeline_without_controlnet();
	let mut scheduler = MockScheduler::new();

	let err = RaveVideoOptions::default().with_size(32, 32).run(&pipeline, &mut scheduler, None).unwrap_err();
	assert!(matches!(err.downcast_ref::<DiffusersError>(), Some(DiffusersError::Validation(_))));

	let err = base_options(&frames).with_steps(0).run(&pipeline, &mut scheduler, None).unwrap_err();
	assert!(matches!(err.downcast_ref::<DiffusersError>(), Some(DiffusersError::Validation(_))));

	let err = base_options(&frames).with_strength(0.0).run(&pipeline, &mut scheduler, None).unwrap_err();
	assert!(matches!(err.downcast_ref::<DiffusersError>(), Some(DiffusersError::Validation(_))));

	let err = base_options(&frames)
		.with_control_window(ActivationWindow::new(0.8, 0.2))
		.run(&pipeline, &mut scheduler, None)
		.unwrap_err();
	assert!(matches!(err.downcast_ref::<DiffusersError>(), Some(DiffusersError::Validation(_))));

	// a degenerate window never activates
	let err = base_options(&frames)
		.with_control_window(ActivationWindow::new(0.5, 0.5))
		.run(&pipeline, &mut scheduler, None)
		.unwrap_err();
	assert!(matches!(err.downcast_ref::<DiffusersError>(), Some(DiffusersError::Validation(_))));

	// a zero-frequency callback would divide by zero in the loop
	let err = base_options(&frames)
		.callback_progress(0, |_, _| true)
		.run(&pipeline, &mut scheduler, None)
		.unwrap_err();
	assert!(matches!(err.downcast_ref::<DiffusersError>(), Some(DiffusersError::Validation(_))));

	// inversion conditioning videos without an inversion stage
	let err = base_options(&frames)
		.with_inversion_control_videos(&[test_frames(8, 32)])
		.run(&pipeline, &mut scheduler, None)
		.unwrap_err();
	assert!(matches!(err.downcast_ref::<DiffusersError>(), Some(DiffusersError::Validation(_))));

	// inversion configured but no inverse scheduler supplied
	let err = base_options(&frames)
		.with_inversion(InversionOptions {
			positive_prompt: "a sailboat".into(),
			..Default::default()
		})
		.run(&pipeline, &mut scheduler, None)
		.unwrap_err();
	assert!(matches!(err.downcast_ref::<DiffusersError>(), Some(DiffusersError::Validation(_))));
}

#[test]
fn guidance_disabled_never_doubles_the_batch() {
	let frames = test_frames(8, 32);
	let batches = Rc::new(RefCell::new(Vec::new()));
	let pipeline = RavePipeline::new(
		Box::new(MockTextEncoder::default()),
		Box::new(IdentityVae),
		Box::new(ZeroDenoiser {
			batches: batches.clone(),
			..ZeroDenoiser::default()
		}),
		ControlNetConfig::Multiple(Vec::new())
	);

	base_options(&frames)
		.with_guidance_scale(1.0)
		.run(&pipeline, &mut MockScheduler::new(), None)
		.unwrap();
	assert!(batches.borrow().iter().all(|&b| b == 2));

	batches.borrow_mut().clear();
	base_options(&frames)
		.with_guidance_scale(7.5)
		.run(&pipeline, &mut MockScheduler::new(), None)
		.unwrap();
	assert!(batches.borrow().iter().all(|&b| b == 4));
}

#[test]
fn activation_window_gates_conditioning() {
	let frames = test_frames(8, 32);
	let controls = test_frames(8, 32);
	let calls = Rc::new(Cell::new(0));
	let scales = Rc::new(RefCell::new(Vec::new()));
	let saw_residuals = Rc::new(RefCell::new(Vec::new()));
	let pipeline = RavePipeline::new(
		Box::new(MockTextEncoder::default()),
		Box::new(IdentityVae),
		Box::new(ZeroDenoiser {
			saw_residuals: saw_residuals.clone(),
			..ZeroDenoiser::default()
		}),
		ControlNetConfig::Single(Box::new(CountingControlNet {
			calls: calls.clone(),
			scales: scales.clone(),
			..CountingControlNet::default()
		}))
	);

	// (0.2, 0.8) over 10 steps leaves steps 2..=7 active; gated-off steps still run the network at scale 0 so the
	// denoiser receives residuals on every step
	base_options(&frames)
		.with_guidance_scale(1.0)
		.with_control_videos(&[controls])
		.with_controlnet_scale(1.0)
		.with_control_window(ActivationWindow::new(0.2, 0.8))
		.run(&pipeline, &mut MockScheduler::new(), None)
		.unwrap();
	assert_eq!(calls.get(), 10);
	assert_eq!(*scales.borrow(), vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
	assert_eq!(*saw_residuals.borrow(), vec![true; 10]);
}

#[test]
fn strength_narrows_the_timestep_window() {
	let frames = test_frames(8, 32);
	let calls = Rc::new(Cell::new(0));
	let pipeline = RavePipeline::new(
		Box::new(MockTextEncoder::default()),
		Box::new(IdentityVae),
		Box::new(ZeroDenoiser {
			calls: calls.clone(),
			..ZeroDenoiser::default()
		}),
		ControlNetConfig::Multiple(Vec::new())
	);

	// strength 0.5 over 10 steps starts halfway down the schedule
	base_options(&frames)
		.with_strength(0.5)
		.run(&pipeline, &mut MockScheduler::new(), None)
		.unwrap();
	assert_eq!(calls.get(), 5);
}

#[test]
fn callback_stops_the_run_early() {
	let frames = test_frames(8, 32);
	let calls = Rc::new(Cell::new(0));
	let pipeline = RavePipeline::new(
		Box::new(MockTextEncoder::default()),
		Box::new(IdentityVae),
		Box::new(ZeroDenoiser {
			calls: calls.clone(),
			..ZeroDenoiser::default()
		}),
		ControlNetConfig::Multiple(Vec::new())
	);

	base_options(&frames)
		.with_guidance_scale(1.0)
		.callback_progress(1, |_, _| false)
		.run(&pipeline, &mut MockScheduler::new(), None)
		.unwrap();
	assert_eq!(calls.get(), 1);
}

#[test]
fn step_end_callback_replaces_latents() {
	let frames = test_frames(8, 32);
	let pipeline = pipeline_without_controlnet();

	let output = base_options(&frames)
		.callback_step_end(1, |step, _, latents| {
			if step == 0 {
				StepChange {
					latents: Some(Array4::zeros(latents.raw_dim())),
					prompt_embeddings: None,
					keep_going: true
				}
			} else {
				StepChange::none()
			}
		})
		.run_latents(&pipeline, &mut MockScheduler::new(), None)
		.unwrap();
	// the pass-through scheduler propagates the replacement unchanged through the remaining steps
	assert!(output.latents.iter().all(|&v| v == 0.0));
}

#[test]
fn inversion_is_deterministic_and_replaces_noise() {
	let frames = test_frames(8, 32);
	let pipeline = pipeline_without_controlnet();
	let inversion = InversionOptions {
		positive_prompt: "the original clip".into(),
		negative_prompt: None,
		steps: 5
	};

	let a = base_options(&frames)
		.with_inversion(inversion.clone())
		.run_latents(&pipeline, &mut MockScheduler::new(), Some(&mut MockScheduler::inverse()))
		.unwrap();
	let b = base_options(&frames)
		.with_inversion(inversion)
		.run_latents(&pipeline, &mut MockScheduler::new(), Some(&mut MockScheduler::inverse()))
		.unwrap();
	assert_eq!(a.latents, b.latents);
}

#[test]
fn inversion_conditions_on_its_own_control_videos() {
	fn flat_frames(n: usize, size: u32, value: f32) -> Vec<DynamicImage> {
		(0..n)
			.map(|_| DynamicImage::ImageRgb32F(Rgb32FImage::from_pixel(size, size, image::Rgb([value, value, value]))))
			.collect()
	}

	let frames = test_frames(8, 32);
	let conditioning_seen = Rc::new(RefCell::new(Vec::new()));
	let pipeline = RavePipeline::new(
		Box::new(MockTextEncoder::default()),
		Box::new(IdentityVae),
		Box::new(ZeroDenoiser::default()),
		ControlNetConfig::Single(Box::new(CountingControlNet {
			conditioning_seen: conditioning_seen.clone(),
			..CountingControlNet::default()
		}))
	);

	base_options(&frames)
		.with_guidance_scale(1.0)
		.with_control_videos(&[flat_frames(8, 32, 0.25)])
		.with_inversion(InversionOptions {
			positive_prompt: "the original clip".into(),
			negative_prompt: None,
			steps: 5
		})
		.with_inversion_control_videos(&[flat_frames(8, 32, 0.75)])
		.run_latents(&pipeline, &mut MockScheduler::new(), Some(&mut MockScheduler::inverse()))
		.unwrap();

	// 5 inversion steps see the inversion conditioning, the 10 denoising steps see the edit's
	let seen = conditioning_seen.borrow();
	assert_eq!(seen.len(), 15);
	assert!(seen[..5].iter().all(|&v| v == 0.75));
	assert!(seen[5..].iter().all(|&v| v == 0.25));
}

#[test]
fn latents_callback_previews_the_predicted_original_sample() {
	let frames = test_frames(8, 32);
	let pipeline = pipeline_without_controlnet();
	let previews = Rc::new(RefCell::new(Vec::new()));

	let previews_in_cb = previews.clone();
	base_options(&frames)
		.callback_latents(1, move |_, _, latents| {
			previews_in_cb.borrow_mut().push(latents[[0, 0, 0, 0]]);
			true
		})
		.run_latents(&pipeline, &mut MockScheduler::predicting_original(), None)
		.unwrap();
	assert_eq!(*previews.borrow(), vec![7.0; 10]);
}

#[test]
fn grid_size_one_degenerates_to_independent_frames() {
	let frames = test_frames(3, 32);
	let pipeline = pipeline_without_controlnet();

	let images = base_options(&frames)
		.with_grid_size(1)
		.run(&pipeline, &mut MockScheduler::new(), None)
		.unwrap();
	assert_eq!(images.len(), 3);
}

#[test]
fn per_grid_prompts_must_match_grid_count() {
	let frames = test_frames(8, 32);
	let pipeline = pipeline_without_controlnet();

	// 8 frames in 2x2 grids -> 2 grids; 3 prompts can't be reconciled
	let err = base_options(&frames)
		.with_prompts(vec!["a", "b", "c"], None::<&str>)
		.run(&pipeline, &mut MockScheduler::new(), None)
		.unwrap_err();
	assert!(matches!(err.downcast_ref::<DiffusersError>(), Some(DiffusersError::Validation(_))));

	// one prompt per grid is accepted
	base_options(&frames)
		.with_prompts(vec!["a", "b"], None::<&str>)
		.run(&pipeline, &mut MockScheduler::new(), None)
		.unwrap();
}
