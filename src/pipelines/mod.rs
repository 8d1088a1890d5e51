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

//! Diffusion pipelines.

use std::{borrow::Cow, ops::Deref};

mod rave;
pub use self::rave::*;

/// Text prompt(s) used as input in diffusion pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Prompt(pub(crate) Vec<String>);

impl Prompt {
	/// Replicates this prompt to `batch` entries: a single prompt is repeated, a multi-prompt must already hold
	/// exactly `batch` entries.
	pub(crate) fn replicate(&self, batch: usize) -> Option<Vec<String>> {
		match self.0.len() {
			1 => Some(vec![self.0[0].clone(); batch]),
			n if n == batch => Some(self.0.clone()),
			_ => None
		}
	}
}

impl Deref for Prompt {
	type Target = Vec<String>;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl<'s> From<&'s str> for Prompt {
	fn from(value: &'s str) -> Self {
		Self(vec![value.to_string()])
	}
}

impl<'s> From<Cow<'s, str>> for Prompt {
	fn from(value: Cow<'s, str>) -> Self {
		Self(vec![value.to_string()])
	}
}

impl From<String> for Prompt {
	fn from(value: String) -> Self {
		Self(vec![value])
	}
}

impl<'s> From<&'s [&'s str]> for Prompt {
	fn from(value: &'s [&'s str]) -> Self {
		Self(value.iter().map(|v| v.to_string()).collect())
	}
}

impl<'s> From<&'s [String]> for Prompt {
	fn from(value: &'s [String]) -> Self {
		Self(value.to_vec())
	}
}

impl<'s> From<Vec<&'s str>> for Prompt {
	fn from(value: Vec<&'s str>) -> Self {
		Self(value.iter().map(|v| v.to_string()).collect())
	}
}

impl From<Vec<String>> for Prompt {
	fn from(value: Vec<String>) -> Self {
		Self(value)
	}
}
