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

//! Embedded crash-tolerant key-value store backed by paired append files.
//!
//! Records live in two files: a fixed-stride entries file describing each
//! record and a data file holding the raw key/value bytes. Every entry
//! carries a digest over its body and its data record, and a per-key
//! wrapping version number, so recovery can drop half-written records and
//! pick the newest surviving version of every key. Superseded records are
//! reclaimed after a configurable delay, after which tail blocks are
//! compacted into the holes and the files are truncated.
//!
//! ```no_run
//! use tandem_db::{Options, Store};
//!
//! let store = Store::open(&Options::with_path("./my-store")).unwrap();
//! store.set(b"hello", b"world").unwrap();
//! assert_eq!(store.get(b"hello").unwrap(), Some(b"world".to_vec()));
//! ```

mod blocks;
mod clock;
mod display;
mod error;
mod file;
mod hash;
mod interval;
mod options;
mod record;
mod store;

pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use options::{Options, DEFAULT_RECLAIM_DELAY};
pub use store::{AllocatedRanges, Cursor, Stats, Store};
