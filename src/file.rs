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

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const MAGIC: [u8; 4] = [0xfa, 0xf2, 0xd6, 0x91];
pub const MAGIC_SIZE: u64 = 4;

#[cfg(target_os = "macos")]
fn disable_read_ahead(file: &std::fs::File) -> Result<()> {
	use std::os::unix::io::AsRawFd;
	if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_RDAHEAD, 0) } != 0 {
		Err(std::io::Error::last_os_error())?
	} else {
		Ok(())
	}
}

#[cfg(not(target_os = "macos"))]
fn disable_read_ahead(_file: &std::fs::File) -> Result<()> {
	Ok(())
}

/// One of the two store files. All access is positional; a file always
/// starts with the 4-byte magic.
pub struct StoreFile {
	file: std::fs::File,
}

impl StoreFile {
	/// Opens or creates `name` under `path`, writing the magic when the file
	/// was never initialized and verifying it otherwise.
	pub fn open(path: &Path, name: &'static str) -> Result<StoreFile> {
		let mut path: PathBuf = path.into();
		path.push(name);
		let file = std::fs::OpenOptions::new()
			.create(true)
			.read(true)
			.write(true)
			.open(path.as_path())?;
		disable_read_ahead(&file)?;
		let file = StoreFile { file };
		if file.len()? < MAGIC_SIZE {
			file.write_at(&MAGIC, 0)?;
			file.sync()?;
		} else {
			let mut magic = [0u8; MAGIC_SIZE as usize];
			file.read_at(&mut magic, 0)?;
			if magic != MAGIC {
				return Err(Error::Corruption(format!("Bad magic in {}", name)));
			}
		}
		Ok(file)
	}

	pub fn len(&self) -> Result<u64> {
		Ok(self.file.metadata()?.len())
	}

	#[cfg(unix)]
	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		use std::os::unix::fs::FileExt;
		Ok(self.file.read_exact_at(buf, offset)?)
	}

	#[cfg(unix)]
	pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
		use std::os::unix::fs::FileExt;
		Ok(self.file.write_all_at(buf, offset)?)
	}

	#[cfg(windows)]
	pub fn read_at(&self, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
		use std::os::windows::fs::FileExt;
		while !buf.is_empty() {
			match self.file.seek_read(buf, offset)? {
				0 => {
					return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into())
				}
				n => {
					let filled = buf;
					buf = &mut filled[n..];
					offset += n as u64;
				}
			}
		}
		Ok(())
	}

	#[cfg(windows)]
	pub fn write_at(&self, mut buf: &[u8], mut offset: u64) -> Result<()> {
		use std::os::windows::fs::FileExt;
		while !buf.is_empty() {
			let n = self.file.seek_write(buf, offset)?;
			buf = &buf[n..];
			offset += n as u64;
		}
		Ok(())
	}

	/// Reads as many bytes as the file holds at `offset`, up to `buf.len()`.
	/// Returns the number of bytes read; fewer than requested means EOF.
	#[cfg(unix)]
	pub fn read_up_to(&self, buf: &mut [u8], mut offset: u64) -> Result<usize> {
		use std::os::unix::fs::FileExt;
		let mut filled = 0;
		while filled < buf.len() {
			match self.file.read_at(&mut buf[filled..], offset) {
				Ok(0) => break,
				Ok(n) => {
					filled += n;
					offset += n as u64;
				}
				Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(e.into()),
			}
		}
		Ok(filled)
	}

	#[cfg(windows)]
	pub fn read_up_to(&self, buf: &mut [u8], mut offset: u64) -> Result<usize> {
		use std::os::windows::fs::FileExt;
		let mut filled = 0;
		while filled < buf.len() {
			match self.file.seek_read(&mut buf[filled..], offset) {
				Ok(0) => break,
				Ok(n) => {
					filled += n;
					offset += n as u64;
				}
				Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(e.into()),
			}
		}
		Ok(filled)
	}

	pub fn sync(&self) -> Result<()> {
		Ok(self.file.sync_data()?)
	}

	pub fn truncate(&self, len: u64) -> Result<()> {
		debug_assert!(len >= MAGIC_SIZE);
		Ok(self.file.set_len(len)?)
	}
}

/// Takes the advisory lock that keeps two engine instances out of the same
/// folder. The lock is held for as long as the returned file is alive.
pub fn lock_folder(path: &Path) -> Result<std::fs::File> {
	use fs2::FileExt;
	let mut path: PathBuf = path.into();
	path.push("lock");
	let file = std::fs::OpenOptions::new()
		.create(true)
		.read(true)
		.write(true)
		.open(path.as_path())?;
	file.try_lock_exclusive().map_err(Error::Locked)?;
	Ok(file)
}
