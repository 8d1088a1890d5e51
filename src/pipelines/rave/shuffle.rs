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

//! Per-step frame shuffling.
//!
//! Shuffling frames between grids at each denoising step is what gives the pipeline temporal consistency: every
//! frame shares a grid with different neighbors on different steps, so the denoiser's cross-frame attention spreads
//! over the whole clip. The pipeline tracks where each original frame currently sits via a `frame_order` table:
//! `frame_order[i]` is the flat slot (grid-major, row-major within a grid) currently holding original frame `i`.
//! Padding slots past the real frame count never move.

use ndarray::{Array4, ArrayView4};
use rand::{seq::SliceRandom, RngCore};

use super::grid;
use crate::DiffusersError;

/// Draws a uniform random permutation of `0..n`.
pub fn generate_permutation(n: usize, rng: &mut dyn RngCore) -> Vec<usize> {
	let mut perm: Vec<usize> = (0..n).collect();
	perm.shuffle(rng);
	perm
}

/// Rearranges frames across grid slots according to `permutation`, applying the identical movement to the latent
/// grids and every conditioning grid, and updates `frame_order` to reflect the new slots.
///
/// Original frame `i`, currently in slot `frame_order[i]`, moves to slot `permutation[i]`. Padding slots (indices at
/// or past `frame_order.len()`) stay where they are.
pub fn shuffle_grids(
	latents: ArrayView4<'_, f32>,
	controls: &[Array4<f32>],
	frame_order: &mut [usize],
	permutation: &[usize],
	grid_size: u32
) -> Result<(Array4<f32>, Vec<Array4<f32>>), DiffusersError> {
	assert_eq!(frame_order.len(), permutation.len(), "permutation length must match tracked frame count");

	let latents = reslot(latents, frame_order, permutation, grid_size)?;
	let controls = controls
		.iter()
		.map(|c| reslot(c.view(), frame_order, permutation, grid_size))
		.collect::<Result<Vec<_>, _>>()?;
	frame_order.copy_from_slice(permutation);
	Ok((latents, controls))
}

/// Splits the grids into frames, scatters tracked frames to their new slots and regathers the grids.
fn reslot(grids: ArrayView4<'_, f32>, frame_order: &[usize], permutation: &[usize], grid_size: u32) -> Result<Array4<f32>, DiffusersError> {
	let frames = grid::unpack(grids, grid_size)?;
	let mut moved = frames.clone();
	for (i, &dest) in permutation.iter().enumerate() {
		moved
			.index_axis_mut(ndarray::Axis(0), dest)
			.assign(&frames.index_axis(ndarray::Axis(0), frame_order[i]));
	}
	grid::pack(moved.view(), grid_size)
}

/// Reorders unpacked frames back into original order using the final `frame_order` table, discarding padding.
pub fn restore_frame_order(frames: ArrayView4<'_, f32>, frame_order: &[usize]) -> Array4<f32> {
	let (_, c, h, w) = (frames.shape()[0], frames.shape()[1], frames.shape()[2], frames.shape()[3]);
	let mut restored = Array4::zeros((frame_order.len(), c, h, w));
	for (i, &slot) in frame_order.iter().enumerate() {
		restored.index_axis_mut(ndarray::Axis(0), i).assign(&frames.index_axis(ndarray::Axis(0), slot));
	}
	restored
}

#[cfg(test)]
mod tests {
	use ndarray::Array4;
	use rand::{rngs::StdRng, SeedableRng};

	use super::*;

	fn numbered_frames(n: usize) -> Array4<f32> {
		Array4::from_shape_fn((n, 1, 2, 2), |(i, _, y, x)| (i * 10 + y * 2 + x) as f32)
	}

	#[test]
	fn permutations_are_seed_deterministic() {
		let mut a = StdRng::seed_from_u64(7);
		let mut b = StdRng::seed_from_u64(7);
		assert_eq!(generate_permutation(16, &mut a), generate_permutation(16, &mut b));
	}

	#[test]
	fn repeated_shuffles_are_invertible() {
		let frames = numbered_frames(8);
		let controls = numbered_frames(8).mapv(|v| v + 0.5);
		let k = 2;

		let mut latents = grid::pack(frames.view(), k).unwrap();
		let mut ctrl = grid::pack(controls.view(), k).unwrap();
		let mut frame_order: Vec<usize> = (0..8).collect();

		let mut rng = StdRng::seed_from_u64(42);
		for _ in 0..5 {
			let perm = generate_permutation(frame_order.len(), &mut rng);
			let (l, mut c) = shuffle_grids(latents.view(), &[ctrl], &mut frame_order, &perm, k).unwrap();
			latents = l;
			ctrl = c.remove(0);
		}

		let unpacked = grid::unpack(latents.view(), k).unwrap();
		assert_eq!(restore_frame_order(unpacked.view(), &frame_order), frames);
		let unpacked_ctrl = grid::unpack(ctrl.view(), k).unwrap();
		assert_eq!(restore_frame_order(unpacked_ctrl.view(), &frame_order), controls);
	}

	#[test]
	fn padding_slots_never_move() {
		// 6 real frames padded out to 8 slots; only the first 6 are tracked.
		let frames = numbered_frames(8);
		let controls = frames.clone();
		let k = 2;

		let latents = grid::pack(frames.view(), k).unwrap();
		let ctrl = grid::pack(controls.view(), k).unwrap();
		let mut frame_order: Vec<usize> = (0..6).collect();

		let perm = vec![3, 0, 5, 2, 1, 4];
		let (latents, _) = shuffle_grids(latents.view(), &[ctrl], &mut frame_order, &perm, k).unwrap();

		let unpacked = grid::unpack(latents.view(), k).unwrap();
		for slot in 6..8 {
			assert_eq!(unpacked.index_axis(ndarray::Axis(0), slot), frames.index_axis(ndarray::Axis(0), slot));
		}
		let restored = restore_frame_order(unpacked.view(), &frame_order);
		assert_eq!(restored.shape()[0], 6);
		for i in 0..6 {
			assert_eq!(restored.index_axis(ndarray::Axis(0), i), frames.index_axis(ndarray::Axis(0), i));
		}
	}

	#[test]
	#[should_panic(expected = "permutation length")]
	fn mismatched_permutation_length_panics() {
		let frames = numbered_frames(4);
		let latents = grid::pack(frames.view(), 2).unwrap();
		let mut frame_order: Vec<usize> = (0..4).collect();
		let _ = shuffle_grids(latents.view(), &[], &mut frame_order, &[0, 1, 2], 2);
	}
}
