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

use thiserror::Error;

/// Structured failures raised by the pipeline itself.
///
/// Errors produced by external collaborators (models, schedulers) are propagated unmodified through
/// [`anyhow::Error`]; no failure here is retried internally because each one signals a broken caller contract
/// rather than a transient fault.
#[derive(Debug, Error)]
pub enum DiffusersError {
	/// Malformed caller input, detected before any model is invoked.
	#[error("invalid input: {0}")]
	Validation(String),
	/// A tensor shape contract between components was violated mid-run.
	#[error("shape mismatch: {0}")]
	ShapeMismatch(String),
	/// A grid's dimensions are not evenly divisible by the grid size.
	#[error("dimensions ({height}x{width}) not divisible by grid size {grid_size}")]
	InvalidDimensions {
		/// Height of the offending tensor.
		height: usize,
		/// Width of the offending tensor.
		width: usize,
		/// The grid size the dimensions were checked against.
		grid_size: usize
	}
}

impl DiffusersError {
	pub(crate) fn validation(msg: impl Into<String>) -> Self {
		Self::Validation(msg.into())
	}

	pub(crate) fn shape(msg: impl Into<String>) -> Self {
		Self::ShapeMismatch(msg.into())
	}
}
