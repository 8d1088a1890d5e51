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

//! Frame grid packing.
//!
//! Video frames are tiled into `k × k` grids so the denoiser processes `k²` frames per forward pass and attends
//! across them. Grid slots are ordered row-major: slot `i` of a grid occupies row `i / k`, column `i % k`.

use ndarray::{s, Array4, ArrayView4};

use crate::DiffusersError;

/// Pads a frame batch up to a multiple of `k²` frames by repeating the final frame, returning the padded batch and
/// the number of padding frames appended.
pub fn pad_to_grid(frames: ArrayView4<'_, f32>, grid_size: u32) -> (Array4<f32>, usize) {
	let per_grid = (grid_size * grid_size) as usize;
	let n = frames.shape()[0];
	let remainder = n % per_grid;
	if remainder == 0 {
		return (frames.to_owned(), 0);
	}

	let pad = per_grid - remainder;
	let (_, c, h, w) = (frames.shape()[0], frames.shape()[1], frames.shape()[2], frames.shape()[3]);
	let mut padded = Array4::zeros((n + pad, c, h, w));
	padded.slice_mut(s![..n, .., .., ..]).assign(&frames);
	let last = frames.slice(s![n - 1, .., .., ..]);
	for i in n..n + pad {
		padded.slice_mut(s![i, .., .., ..]).assign(&last);
	}
	(padded, pad)
}

/// Tiles a batch of frames `(n, c, h, w)` into grids `(n / k², c, h * k, w * k)`.
///
/// The frame count must be an exact multiple of `k²`; pad with [`pad_to_grid`] first.
pub fn pack(frames: ArrayView4<'_, f32>, grid_size: u32) -> Result<Array4<f32>, DiffusersError> {
	let k = grid_size as usize;
	let per_grid = k * k;
	let (n, c, h, w) = (frames.shape()[0], frames.shape()[1], frames.shape()[2], frames.shape()[3]);
	if per_grid == 0 {
		return Err(DiffusersError::validation("grid size must be nonzero"));
	}
	if n % per_grid != 0 {
		return Err(DiffusersError::shape(format!("cannot tile {n} frames into {k}x{k} grids; {n} is not a multiple of {per_grid}")));
	}

	let num_grids = n / per_grid;
	let mut grids = Array4::zeros((num_grids, c, h * k, w * k));
	for g in 0..num_grids {
		for slot in 0..per_grid {
			let (row, col) = (slot / k, slot % k);
			grids
				.slice_mut(s![g, .., row * h..(row + 1) * h, col * w..(col + 1) * w])
				.assign(&frames.slice(s![g * per_grid + slot, .., .., ..]));
		}
	}
	Ok(grids)
}

/// Splits a batch of grids `(m, c, H, W)` back into frames `(m * k², c, H / k, W / k)`, inverting [`pack`].
pub fn unpack(grids: ArrayView4<'_, f32>, grid_size: u32) -> Result<Array4<f32>, DiffusersError> {
	let k = grid_size as usize;
	if k == 0 {
		return Err(DiffusersError::validation("grid size must be nonzero"));
	}
	let (m, c, gh, gw) = (grids.shape()[0], grids.shape()[1], grids.shape()[2], grids.shape()[3]);
	if gh % k != 0 || gw % k != 0 {
		return Err(DiffusersError::InvalidDimensions { height: gh, width: gw, grid_size: k });
	}

	let (h, w) = (gh / k, gw / k);
	let per_grid = k * k;
	let mut frames = Array4::zeros((m * per_grid, c, h, w));
	for g in 0..m {
		for slot in 0..per_grid {
			let (row, col) = (slot / k, slot % k);
			frames
				.slice_mut(s![g * per_grid + slot, .., .., ..])
				.assign(&grids.slice(s![g, .., row * h..(row + 1) * h, col * w..(col + 1) * w]));
		}
	}
	Ok(frames)
}
