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

use blake2_rfc::blake2b::Blake2b;

pub const DIGEST_SIZE: usize = 16;

pub type Digest = [u8; DIGEST_SIZE];

/// Digest of the concatenation of `parts`, in order.
pub fn digest(parts: &[&[u8]]) -> Digest {
	let mut state = Blake2b::new(DIGEST_SIZE);
	for part in parts {
		state.update(part);
	}
	let mut result = [0u8; DIGEST_SIZE];
	result.copy_from_slice(state.finalize().as_bytes());
	result
}
