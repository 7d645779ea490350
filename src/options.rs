// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of Parity.

// Parity is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity.  If not, see <http://www.gnu.org/licenses/>.

use std::path::PathBuf;

/// Delay before a superseded record's disk space is reclaimed.
pub const DEFAULT_RECLAIM_DELAY: u64 = 900_000;

#[derive(Clone, Debug)]
pub struct Options {
	/// Folder that holds the entries, data and lock files.
	pub path: PathBuf,
	/// Reclaim delay in milliseconds. Zero suppresses the wall clock and
	/// frees superseded records inline.
	pub reclaim_delay: u64,
}

impl Options {
	pub fn with_path<P: Into<PathBuf>>(path: P) -> Options {
		Options {
			path: path.into(),
			reclaim_delay: DEFAULT_RECLAIM_DELAY,
		}
	}

	pub fn reclaim_delay(mut self, millis: u64) -> Options {
		self.reclaim_delay = millis;
		self
	}
}
