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

//! Classifier-free guidance.

use ndarray::{s, Array4, ArrayView4};

use crate::DiffusersError;

/// Whether classifier-free guidance applies for a given guidance scale.
///
/// At a scale of 1.0 or below the guided prediction reduces to the conditional prediction alone, so the pipeline
/// skips the unconditional pass entirely rather than doubling every batch.
pub fn guidance_enabled(guidance_scale: f32) -> bool {
	guidance_scale > 1.0
}

/// Combines unconditional and conditional noise predictions: `u + scale * (c - u)`.
pub fn combine(unconditional: ArrayView4<'_, f32>, conditional: ArrayView4<'_, f32>, guidance_scale: f32) -> Array4<f32> {
	&unconditional + guidance_scale * (&conditional - &unconditional)
}

/// Splits a doubled-batch noise prediction into its unconditional and conditional halves and combines them.
pub fn split_and_combine(noise_pred: ArrayView4<'_, f32>, guidance_scale: f32) -> Result<Array4<f32>, DiffusersError> {
	let batch = noise_pred.shape()[0];
	if batch % 2 != 0 {
		return Err(DiffusersError::shape(format!(
			"expected a doubled batch for guidance, got odd batch size {batch}"
		)));
	}
	let half = batch / 2;
	Ok(combine(noise_pred.slice(s![..half, .., .., ..]), noise_pred.slice(s![half.., .., .., ..]), guidance_scale))
}

#[cfg(test)]
mod tests {
	use ndarray::{concatenate, Array4, Axis};

	use super::*;

	#[test]
	fn enabled_only_above_one() {
		assert!(!guidance_enabled(1.0));
		assert!(!guidance_enabled(0.5));
		assert!(guidance_enabled(1.01));
		assert!(guidance_enabled(7.5));
	}

	#[test]
	fn scale_one_yields_conditional() {
		let u = Array4::from_elem((1, 2, 2, 2), 3.0);
		let c = Array4::from_elem((1, 2, 2, 2), 5.0);
		assert_eq!(combine(u.view(), c.view(), 1.0), c);
	}

	#[test]
	fn scale_zero_yields_unconditional() {
		let u = Array4::from_elem((1, 2, 2, 2), 3.0);
		let c = Array4::from_elem((1, 2, 2, 2), 5.0);
		assert_eq!(combine(u.view(), c.view(), 0.0), u);
	}

	#[test]
	fn split_matches_manual_combination() {
		let u = Array4::from_shape_fn((2, 1, 2, 2), |(i, _, y, x)| (i + y + x) as f32);
		let c = u.mapv(|v| v * 2.0 + 1.0);
		let doubled = concatenate![Axis(0), u.view(), c.view()];
		let guided = split_and_combine(doubled.view(), 7.5).unwrap();
		assert_eq!(guided, combine(u.view(), c.view(), 7.5));
	}

	#[test]
	fn odd_batch_is_rejected() {
		let pred = Array4::zeros((3, 1, 2, 2));
		assert!(split_and_combine(pred.view(), 7.5).is_err());
	}
}
