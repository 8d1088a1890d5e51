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

//! Per-step conditioning network activation windows.

use crate::DiffusersError;

/// The fraction of the denoising schedule over which a conditioning network is active.
///
/// A network with window `(0.0, 1.0)` contributes on every step. Narrower windows restrict guidance to the middle of
/// the schedule, which can reduce artifacts from overconditioning the earliest and latest steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivationWindow {
	/// Fraction of the schedule at which the network switches on, in `[0, 1]`.
	pub start: f32,
	/// Fraction of the schedule at which the network switches off, in `[0, 1]`.
	pub end: f32
}

impl Default for ActivationWindow {
	fn default() -> Self {
		ActivationWindow { start: 0.0, end: 1.0 }
	}
}

impl ActivationWindow {
	/// Creates a window active between `start` and `end` fractions of the schedule.
	pub fn new(start: f32, end: f32) -> Self {
		ActivationWindow { start, end }
	}

	pub(crate) fn validate(&self) -> Result<(), DiffusersError> {
		if !(0.0..=1.0).contains(&self.start) || !(0.0..=1.0).contains(&self.end) {
			return Err(DiffusersError::validation(format!(
				"activation window bounds must lie in [0, 1], got ({}, {})",
				self.start, self.end
			)));
		}
		if self.start >= self.end {
			return Err(DiffusersError::validation(format!(
				"activation window start {} must be below end {}",
				self.start, self.end
			)));
		}
		Ok(())
	}

	/// The multiplicative keep weight for `step` out of `total_steps`: 1.0 inside the window, 0.0 outside.
	pub fn keep_weight(&self, step: usize, total_steps: usize) -> f32 {
		let below = (step as f32 / total_steps as f32) < self.start;
		let above = ((step + 1) as f32 / total_steps as f32) > self.end;
		if below || above { 0.0 } else { 1.0 }
	}
}

/// Keep weights for every attached network at a given step.
pub fn keep_weights(step: usize, total_steps: usize, windows: &[ActivationWindow]) -> Vec<f32> {
	windows.iter().map(|w| w.keep_weight(step, total_steps)).collect()
}

/// The full per-step keep-weight table for a schedule of `total_steps` steps.
pub fn keep_schedule(total_steps: usize, windows: &[ActivationWindow]) -> Vec<Vec<f32>> {
	(0..total_steps).map(|step| keep_weights(step, total_steps, windows)).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn full_window_always_active() {
		let w = ActivationWindow::default();
		for step in 0..20 {
			assert_eq!(w.keep_weight(step, 20), 1.0);
		}
	}

	#[test]
	fn partial_window_gates_edges() {
		let w = ActivationWindow::new(0.2, 0.8);
		let weights: Vec<f32> = (0..10).map(|s| w.keep_weight(s, 10)).collect();
		assert_eq!(weights, vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
	}

	#[test]
	fn per_network_weights() {
		let windows = [ActivationWindow::default(), ActivationWindow::new(0.5, 1.0)];
		assert_eq!(keep_weights(0, 10, &windows), vec![1.0, 0.0]);
		assert_eq!(keep_weights(5, 10, &windows), vec![1.0, 1.0]);
	}

	#[test]
	fn schedule_table_matches_per_step_weights() {
		let windows = [ActivationWindow::new(0.2, 0.8)];
		let table = keep_schedule(10, &windows);
		assert_eq!(table.len(), 10);
		for (step, row) in table.iter().enumerate() {
			assert_eq!(row, &keep_weights(step, 10, &windows));
		}
	}

	#[test]
	fn validation_rejects_inverted_and_out_of_range() {
		assert!(ActivationWindow::new(0.8, 0.2).validate().is_err());
		assert!(ActivationWindow::new(-0.1, 0.5).validate().is_err());
		assert!(ActivationWindow::new(0.0, 1.5).validate().is_err());
		// a degenerate window would gate the network off at every step
		assert!(ActivationWindow::new(0.5, 0.5).validate().is_err());
		assert!(ActivationWindow::new(0.2, 0.8).validate().is_ok());
	}
}
