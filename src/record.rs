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

// On disk data layout.
//
// Both files start with the 4-byte magic.
//
// Entry (entries file, 36 bytes):
// [VERSION: 1][DIGEST: 16][LOCATION: 7][DATA_VERSION: 4][KEY_SIZE: 4][VALUE_SIZE: 4]
// VERSION - entry format version, must be 0.
// DIGEST - 16-byte digest over the 19-byte entry body followed by the
// referenced data record.
// LOCATION - absolute offset of the data record. 56-bit value: the low 48
// bits big-endian first, the high 8 bits in the trailing byte.
// DATA_VERSION - per-key wrapping counter disambiguating duplicates.
// KEY_SIZE, VALUE_SIZE - byte lengths of key and value.
// All multi-byte integers are big-endian.
//
// Data record (data file):
// [VERSION: 1][KEY: KEY_SIZE][VALUE: VALUE_SIZE]
// VERSION - data format version, must be 0.

use crate::hash;

pub const ENTRY_FORMAT: u8 = 0;
pub const DATA_FORMAT: u8 = 0;

const LOCATION_SIZE: usize = 7;
const VERSION_SIZE: usize = 4;
const SIZE_SIZE: usize = 4;

pub const HEADER_SIZE: usize = 1 + hash::DIGEST_SIZE;
pub const BODY_SIZE: usize = LOCATION_SIZE + VERSION_SIZE + SIZE_SIZE * 2;
pub const ENTRY_SIZE: usize = HEADER_SIZE + BODY_SIZE;

pub const MAX_LOCATION: u64 = (1 << 56) - 1;

struct Buf<B>(usize, B);

impl<B: AsRef<[u8]> + AsMut<[u8]>> Buf<B> {
	fn new(data: B) -> Self {
		Buf(0, data)
	}

	fn write_slice(&mut self, buf: &[u8]) {
		let start = self.0;
		self.0 += buf.len();
		self.1.as_mut()[start..self.0].copy_from_slice(buf);
	}

	fn read_slice(&mut self, size: usize) -> &[u8] {
		let start = self.0;
		self.0 += size;
		&self.1.as_ref()[start..self.0]
	}

	fn write_u32(&mut self, value: u32) {
		self.write_slice(&value.to_be_bytes());
	}

	fn read_u32(&mut self) -> u32 {
		use std::convert::TryInto;
		u32::from_be_bytes(self.read_slice(VERSION_SIZE).try_into().unwrap())
	}

	fn write_location(&mut self, location: u64) {
		debug_assert!(location <= MAX_LOCATION);
		let bytes = location.to_be_bytes();
		self.write_slice(&bytes[2..8]);
		self.write_slice(&bytes[1..2]);
	}

	fn read_location(&mut self) -> u64 {
		let mut bytes = [0u8; 8];
		bytes[2..8].copy_from_slice(self.read_slice(6));
		bytes[1] = self.read_slice(1)[0];
		u64::from_be_bytes(bytes)
	}
}

/// The decoded body of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRecord {
	pub data_location: u64,
	pub data_version: u32,
	pub key_size: u32,
	pub value_size: u32,
}

impl EntryRecord {
	pub fn encode(&self) -> [u8; BODY_SIZE] {
		let mut buf = Buf::new([0u8; BODY_SIZE]);
		buf.write_location(self.data_location);
		buf.write_u32(self.data_version);
		buf.write_u32(self.key_size);
		buf.write_u32(self.value_size);
		buf.1
	}

	/// Decodes a 19-byte entry body. The digest is checked separately with
	/// `verify` once the referenced data record is at hand.
	pub fn decode(body: &[u8]) -> EntryRecord {
		let mut bytes = [0u8; BODY_SIZE];
		bytes.copy_from_slice(body);
		let mut buf = Buf::new(bytes);
		EntryRecord {
			data_location: buf.read_location(),
			data_version: buf.read_u32(),
			key_size: buf.read_u32(),
			value_size: buf.read_u32(),
		}
	}

	/// Byte length of the referenced data record.
	pub fn data_len(&self) -> u64 {
		1 + self.key_size as u64 + self.value_size as u64
	}

	/// Builds the entry header: format byte plus the digest over
	/// `body || data_record`.
	pub fn seal(body: &[u8], data_record: &[u8]) -> [u8; HEADER_SIZE] {
		let mut header = [0u8; HEADER_SIZE];
		header[0] = ENTRY_FORMAT;
		header[1..].copy_from_slice(&hash::digest(&[body, data_record]));
		header
	}

	/// Checks both format bytes and the digest of a stored entry against the
	/// data record it points at.
	pub fn verify(header: &[u8], body: &[u8], data_record: &[u8]) -> bool {
		header.len() == HEADER_SIZE
			&& header[0] == ENTRY_FORMAT
			&& data_record.first() == Some(&DATA_FORMAT)
			&& header[1..] == hash::digest(&[body, data_record])[..]
	}
}

pub fn data_record(key: &[u8], value: &[u8]) -> Vec<u8> {
	let mut record = Vec::with_capacity(1 + key.len() + value.len());
	record.push(DATA_FORMAT);
	record.extend_from_slice(key);
	record.extend_from_slice(value);
	record
}
