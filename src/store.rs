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

// The persistency engine.
//
// Keys map to the newest live record through an insertion-ordered index.
// Every record occupies one block in each of the two block directories: a
// fixed-size entry in the entries file and a variable-size data record in
// the data file. A write lands the data record first, fsyncs, then the
// entry, fsyncs again; a crash in between leaves a record whose digest
// cannot verify, so recovery falls back to the previous version of the key.
//
// Superseded records are not freed immediately. They are queued with a
// deadline and drained by the reclamation timer (or inline when the delay
// is zero), after which compaction relocates tail blocks into the holes and
// the files are truncated.

use std::collections::{HashMap, VecDeque};
use std::convert::TryFrom;
use std::ops::Range;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};

use crate::{
	blocks::{Arena, BlockDirectory, BlockId},
	clock::{Clock, SystemClock, TimerControl, TimerThread},
	display::hex,
	error::{Error, Result},
	file::{lock_folder, StoreFile, MAGIC_SIZE},
	options::Options,
	record::{self, EntryRecord, ENTRY_FORMAT, ENTRY_SIZE, HEADER_SIZE},
};

const ENTRIES_FILE: &str = "entries.db";
const DATA_FILE: &str = "data.db";

type EntryId = u32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Purging {
	None,
	EntryOnly,
	EntryAndData,
}

struct LiveEntry {
	key: Box<[u8]>,
	entry_block: BlockId,
	data_block: BlockId,
	value_location: u64,
	data_version: u32,
	purging: Purging,
}

struct Reclaim {
	deadline: u64,
	entry: EntryId,
}

// Working copy of one free gap during a compaction pass. The anchor a
// relocation lands after is `next_block`'s chain predecessor, which is the
// most recently placed block once the gap starts filling up.
struct GapCursor {
	location: u64,
	space: u64,
	next_block: BlockId,
}

/// Coalesced allocated byte ranges of both files, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedRanges {
	pub entries: Vec<Range<u64>>,
	pub data: Vec<Range<u64>>,
}

/// Point-in-time usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
	pub keys: usize,
	/// Superseded records still occupying disk space until reclamation.
	pub superseded_records: usize,
	pub pending_reclaims: usize,
	pub entries_file_size: u64,
	pub data_file_size: u64,
	/// Bytes of each file covered by allocated blocks, header included.
	pub entries_allocated_bytes: u64,
	pub data_allocated_bytes: u64,
}

/// `a` is newer than `b` when their wrapped distance is in `[1, 2³¹)`.
fn newer_than(a: u32, b: u32) -> bool {
	a.wrapping_sub(b) as i32 > 0
}

/// An embedded key-value store over two append-style files.
///
/// All operations are serialized on an internal mutex; the reclamation
/// timer re-enters through the same mutex as a new top-level call.
pub struct Store {
	inner: Arc<Mutex<Inner>>,
	timer: Option<TimerThread>,
}

impl Store {
	pub fn open(options: &Options) -> Result<Store> {
		Self::open_internal(options, Arc::new(SystemClock), true)
	}

	fn open_internal(
		options: &Options,
		clock: Arc<dyn Clock>,
		with_timer: bool,
	) -> Result<Store> {
		if options.path.as_os_str().is_empty() {
			return Err(Error::InvalidConfiguration("Invalid folder".into()));
		}
		std::fs::create_dir_all(&options.path)?;
		let lock = lock_folder(&options.path)?;
		let inner = Inner::open(options, clock.clone(), lock)?;
		let inner = Arc::new(Mutex::new(inner));
		let timer = if with_timer {
			let weak = Arc::downgrade(&inner);
			let thread = TimerThread::spawn(clock, move || {
				if let Some(inner) = weak.upgrade() {
					if let Err(e) = inner.lock().on_timer() {
						log::warn!(target: "tandem-db", "Reclaim timer failure: {}", e);
					}
				}
			})?;
			let mut guard = inner.lock();
			guard.timer = Some(thread.control());
			if let Some(front) = guard.reclaim.front() {
				let deadline = front.deadline;
				guard.arm_timer(deadline);
			}
			drop(guard);
			Some(thread)
		} else {
			None
		};
		Ok(Store { inner, timer })
	}

	pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
		self.inner.lock().set(key, value)
	}

	pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		self.inner.lock().get(key)
	}

	pub fn delete(&self, key: &[u8]) -> Result<bool> {
		self.inner.lock().delete(key)
	}

	pub fn count(&self) -> usize {
		self.inner.lock().index.len()
	}

	/// Lazy iteration over the current records in key insertion order.
	/// Values are read from disk on demand. The cursor holds the store lock;
	/// mutating through another handle while it is alive deadlocks.
	pub fn cursor(&self) -> Cursor {
		Cursor { inner: self.inner.lock(), position: 0 }
	}

	pub fn allocated_ranges(&self) -> AllocatedRanges {
		let inner = self.inner.lock();
		AllocatedRanges {
			entries: inner.entries.allocated_ranges(),
			data: inner.data.allocated_ranges(),
		}
	}

	pub fn stats(&self) -> Stats {
		fn covered(ranges: &[Range<u64>]) -> u64 {
			ranges.iter().map(|range| range.end - range.start).sum()
		}
		let inner = self.inner.lock();
		Stats {
			keys: inner.index.len(),
			superseded_records: inner.live.len() - inner.index.len(),
			pending_reclaims: inner.reclaim.len(),
			entries_file_size: inner.entries_size,
			data_file_size: inner.data_size,
			entries_allocated_bytes: covered(&inner.entries.allocated_ranges()),
			data_allocated_bytes: covered(&inner.data.allocated_ranges()),
		}
	}

	/// Drains expired reclamations, compacts, truncates, fsyncs and closes
	/// both files. Idempotent; any further operation fails with `Closed`.
	pub fn close(&self) -> Result<()> {
		self.inner.lock().close()?;
		if let Some(timer) = &self.timer {
			timer.control().shutdown();
		}
		Ok(())
	}
}

impl Drop for Store {
	fn drop(&mut self) {
		let _ = self.inner.lock().close();
	}
}

pub struct Cursor<'a> {
	inner: MutexGuard<'a, Inner>,
	position: usize,
}

impl<'a> Iterator for Cursor<'a> {
	type Item = Result<(Vec<u8>, Vec<u8>)>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.inner.closed {
			return None;
		}
		let (key, id) = {
			let (key, ids) = self.inner.index.get_index(self.position)?;
			(key.to_vec(), *ids.last().expect("key lists are never empty"))
		};
		self.position += 1;
		Some(self.inner.read_value(id).map(|value| (key, value)))
	}
}

struct Inner {
	entries_file: Option<StoreFile>,
	data_file: Option<StoreFile>,
	lock: Option<std::fs::File>,
	entries: BlockDirectory<EntryId>,
	data: BlockDirectory<EntryId>,
	live: Arena<LiveEntry>,
	index: IndexMap<Box<[u8]>, Vec<EntryId>>,
	reclaim: VecDeque<Reclaim>,
	reclaim_delay: u64,
	clock: Arc<dyn Clock>,
	timer: Option<TimerControl>,
	timer_armed: bool,
	entries_size: u64,
	data_size: u64,
	closed: bool,
}

// Survivor of the sequential entries scan at load time.
struct Loaded {
	entry_location: u64,
	record: EntryRecord,
	key: Box<[u8]>,
}

impl Inner {
	fn open(options: &Options, clock: Arc<dyn Clock>, lock: std::fs::File) -> Result<Inner> {
		let entries_file = StoreFile::open(&options.path, ENTRIES_FILE)?;
		let data_file = StoreFile::open(&options.path, DATA_FILE)?;
		let entries_size = entries_file.len()?;
		let data_size = data_file.len()?;
		let mut inner = Inner {
			entries_file: Some(entries_file),
			data_file: Some(data_file),
			lock: Some(lock),
			entries: BlockDirectory::new(MAGIC_SIZE),
			data: BlockDirectory::new(MAGIC_SIZE),
			live: Arena::new(),
			index: IndexMap::new(),
			reclaim: VecDeque::new(),
			reclaim_delay: options.reclaim_delay,
			clock,
			timer: None,
			timer_armed: false,
			entries_size,
			data_size,
			closed: false,
		};
		inner.load()?;
		Ok(inner)
	}

	fn entries_file(&self) -> &StoreFile {
		self.entries_file.as_ref().expect("checked by ensure_open")
	}

	fn data_file(&self) -> &StoreFile {
		self.data_file.as_ref().expect("checked by ensure_open")
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed {
			Err(Error::Closed)
		} else {
			Ok(())
		}
	}

	fn now(&self) -> u64 {
		if self.reclaim_delay == 0 {
			0
		} else {
			self.clock.now()
		}
	}

	// Sequentially validates the entries file, deduplicates by key using the
	// wrapping data version, seeds both directories with the surviving
	// layout, then compacts the same way runtime mutations do.
	fn load(&mut self) -> Result<()> {
		let data_size = self.data_size;
		let mut survivors: Vec<Loaded> = Vec::new();
		let mut position = MAGIC_SIZE;
		loop {
			let mut raw = [0u8; ENTRY_SIZE];
			let read = self.entries_file().read_up_to(&mut raw, position)?;
			if read == 0 {
				break;
			}
			if read < ENTRY_SIZE {
				log::warn!(target: "tandem-db", "Dropping partial entry at {}", position);
				break;
			}
			let entry_location = position;
			position += ENTRY_SIZE as u64;
			if raw[0] != ENTRY_FORMAT {
				log::warn!(target: "tandem-db", "Skipping bad entry version at {}", entry_location);
				continue;
			}
			let record = EntryRecord::decode(&raw[HEADER_SIZE..]);
			if record.data_location < MAGIC_SIZE
				|| record.data_location + record.data_len() > data_size
			{
				log::warn!(
					target: "tandem-db",
					"Skipping entry at {} with data record out of bounds",
					entry_location,
				);
				continue;
			}
			let mut data = vec![0u8; record.data_len() as usize];
			if self.data_file().read_up_to(&mut data, record.data_location)? < data.len() {
				log::warn!(target: "tandem-db", "Skipping truncated data record at {}", entry_location);
				continue;
			}
			if !EntryRecord::verify(&raw[..HEADER_SIZE], &raw[HEADER_SIZE..], &data) {
				log::warn!(target: "tandem-db", "Skipping corrupt entry at {}", entry_location);
				continue;
			}
			let key = data[1..1 + record.key_size as usize].to_vec().into_boxed_slice();
			survivors.push(Loaded { entry_location, record, key });
		}

		// Entries claiming overlapping data bytes cannot both be valid.
		// Exact duplicates of one key at one location are the relocated
		// entry case and share a block.
		let mut order: Vec<usize> = (0..survivors.len()).collect();
		order.sort_by_key(|&i| (survivors[i].record.data_location, survivors[i].entry_location));
		let mut dropped = vec![false; survivors.len()];
		let mut last_claim: Option<usize> = None;
		for &i in &order {
			let survivor = &survivors[i];
			if let Some(prev) = last_claim {
				let previous = &survivors[prev];
				let duplicate = previous.record.data_location == survivor.record.data_location
					&& previous.record.data_len() == survivor.record.data_len()
					&& previous.key == survivor.key;
				if duplicate {
					continue;
				}
				if survivor.record.data_location
					< previous.record.data_location + previous.record.data_len()
				{
					log::warn!(
						target: "tandem-db",
						"Dropping entry at {} with overlapping data record",
						survivor.entry_location,
					);
					dropped[i] = true;
					continue;
				}
			}
			last_claim = Some(i);
		}

		let mut groups: IndexMap<Box<[u8]>, Vec<usize>> = IndexMap::new();
		for (i, survivor) in survivors.iter().enumerate() {
			if !dropped[i] {
				groups.entry(survivor.key.clone()).or_default().push(i);
			}
		}

		// Newest survivor of each key wins; duplicates after wrapping prefer
		// the higher entry location.
		for ids in groups.values_mut() {
			let mut winner = 0;
			for candidate in 1..ids.len() {
				let a = &survivors[ids[candidate]];
				let w = &survivors[ids[winner]];
				if newer_than(a.record.data_version, w.record.data_version)
					|| (a.record.data_version == w.record.data_version
						&& a.entry_location > w.entry_location)
				{
					winner = candidate;
				}
			}
			let winner = ids.remove(winner);
			ids.push(winner);
		}

		// One owner per data block: the winner when it shares the location,
		// otherwise the latest claimant. Non-owners free only their entry.
		let mut data_owner: HashMap<u64, usize> = HashMap::new();
		let mut live_ids: Vec<Option<EntryId>> = vec![None; survivors.len()];
		let mut superseded = 0;
		for (key, ids) in &groups {
			let winner = *ids.last().expect("groups are non-empty");
			for &i in ids {
				let location = survivors[i].record.data_location;
				match data_owner.get(&location).copied() {
					None => {
						data_owner.insert(location, i);
					}
					Some(current) => {
						if i == winner
							|| (current != winner
								&& survivors[i].entry_location > survivors[current].entry_location)
						{
							data_owner.insert(location, i);
						}
					}
				}
			}
			for &i in ids {
				let survivor = &survivors[i];
				let purging = if i == winner {
					Purging::None
				} else if data_owner[&survivor.record.data_location] == i {
					Purging::EntryAndData
				} else {
					Purging::EntryOnly
				};
				let id = self.live.insert(LiveEntry {
					key: key.clone(),
					entry_block: 0,
					data_block: 0,
					value_location: survivor.record.data_location
						+ 1 + survivor.record.key_size as u64,
					data_version: survivor.record.data_version,
					purging,
				});
				live_ids[i] = Some(id);
			}
			self.index.insert(
				key.clone(),
				ids.iter().map(|&i| live_ids[i].expect("just created")).collect(),
			);
			superseded += ids.len() - 1;
		}

		for (i, survivor) in survivors.iter().enumerate() {
			if let Some(id) = live_ids[i] {
				let block = self.entries.add(
					survivor.entry_location,
					survivor.entry_location + ENTRY_SIZE as u64,
					id,
				);
				self.live.get_mut(id).entry_block = block;
			}
		}
		let mut data_blocks: HashMap<u64, BlockId> = HashMap::new();
		for &i in &order {
			let id = match live_ids[i] {
				Some(id) => id,
				None => continue,
			};
			let survivor = &survivors[i];
			let location = survivor.record.data_location;
			let block = match data_blocks.get(&location).copied() {
				Some(block) => block,
				None => {
					let owner = live_ids[data_owner[&location]].expect("owners are live");
					let block = self.data.add(location, location + survivor.record.data_len(), owner);
					data_blocks.insert(location, block);
					block
				}
			};
			self.live.get_mut(id).data_block = block;
		}

		let deadline = self.now().saturating_add(self.reclaim_delay);
		for ids in groups.values() {
			for &i in &ids[..ids.len() - 1] {
				let entry = live_ids[i].expect("losers are live");
				debug_assert!(self.live.get(entry).purging != Purging::None);
				self.reclaim.push_back(Reclaim { deadline, entry });
			}
		}

		log::debug!(
			target: "tandem-db",
			"Loaded {} keys ({} entries, {} superseded)",
			self.index.len(),
			self.live.len(),
			superseded,
		);
		self.run_compaction()?;
		self.maybe_truncate()?;
		self.entries_file().sync()?;
		self.data_file().sync()?;
		Ok(())
	}

	fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
		self.ensure_open()?;
		let key_size = u32::try_from(key.len())
			.map_err(|_| Error::InvalidInput("Key length exceeds 32 bits".into()))?;
		let value_size = u32::try_from(value.len())
			.map_err(|_| Error::InvalidInput("Value length exceeds 32 bits".into()))?;
		if self.check_reclaim() {
			self.run_compaction()?;
		}
		self.maybe_truncate()?;
		log::trace!(target: "tandem-db", "Set {}: {} bytes", hex(key), value.len());
		let previous = self.index.get(key).map(|ids| *ids.last().expect("key lists are never empty"));
		let data_version = match previous {
			Some(id) => self.live.get(id).data_version.wrapping_add(1),
			None => 0,
		};
		let new_id = self.live.insert(LiveEntry {
			key: key.into(),
			entry_block: 0,
			data_block: 0,
			value_location: 0,
			data_version,
			purging: Purging::None,
		});
		let entry_block = self.entries.alloc(ENTRY_SIZE as u64, new_id);
		let data_block = self.data.alloc(1 + key.len() as u64 + value.len() as u64, new_id);
		let entry_location = self.entries.block(entry_block).start();
		let data_location = self.data.block(data_block).start();
		{
			let entry = self.live.get_mut(new_id);
			entry.entry_block = entry_block;
			entry.data_block = data_block;
			entry.value_location = data_location + 1 + key.len() as u64;
		}
		match self.index.get_mut(key) {
			Some(ids) => ids.push(new_id),
			None => {
				self.index.insert(key.into(), vec![new_id]);
			}
		}
		let data = record::data_record(key, value);
		let body = EntryRecord { data_location, data_version, key_size, value_size }.encode();
		let header = EntryRecord::seal(&body, &data);
		self.write_data(&data, data_location)?;
		self.data_file().sync()?;
		self.write_entry(&header, &body, entry_location)?;
		self.entries_file().sync()?;
		self.maybe_truncate()?;
		if let Some(old_id) = previous {
			if self.reclaim_delay == 0 {
				let hole = self.free_superseded(key);
				self.maybe_truncate()?;
				if hole {
					self.run_compaction()?;
				}
			} else {
				self.queue_reclaim(old_id, Purging::EntryAndData);
			}
		}
		Ok(())
	}

	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		self.ensure_open()?;
		let id = match self.index.get(key) {
			Some(ids) => *ids.last().expect("key lists are never empty"),
			None => return Ok(None),
		};
		Ok(Some(self.read_value(id)?))
	}

	fn read_value(&self, id: EntryId) -> Result<Vec<u8>> {
		let entry = self.live.get(id);
		let end = self.data.block(entry.data_block).end();
		let mut value = vec![0u8; (end - entry.value_location) as usize];
		self.data_file().read_at(&mut value, entry.value_location)?;
		Ok(value)
	}

	fn delete(&mut self, key: &[u8]) -> Result<bool> {
		self.ensure_open()?;
		let ids = match self.index.shift_remove(key) {
			Some(ids) => ids,
			None => return Ok(false),
		};
		log::trace!(target: "tandem-db", "Delete {}", hex(key));
		let mut hole = false;
		for id in ids {
			let entry = self.live.remove(id);
			if entry.purging != Purging::None {
				self.reclaim.retain(|reclaim| reclaim.entry != id);
			}
			hole |= !self.entries.free(entry.entry_block);
			if entry.purging != Purging::EntryOnly {
				hole |= !self.data.free(entry.data_block);
			}
		}
		self.entries_file().sync()?;
		if hole {
			self.run_compaction()?;
		}
		self.maybe_truncate()?;
		Ok(true)
	}

	// Frees every superseded record of `key` right away. Zero-delay mode
	// only; the queued path goes through `check_reclaim`.
	fn free_superseded(&mut self, key: &[u8]) -> bool {
		let superseded: Vec<EntryId> = {
			let ids = self.index.get_mut(key).expect("caller just updated the key");
			let keep = ids.len() - 1;
			ids.drain(..keep).collect()
		};
		let mut hole = false;
		for id in superseded {
			let entry = self.live.remove(id);
			if entry.purging != Purging::None {
				self.reclaim.retain(|reclaim| reclaim.entry != id);
			}
			hole |= !self.entries.free(entry.entry_block);
			if entry.purging != Purging::EntryOnly {
				hole |= !self.data.free(entry.data_block);
			}
		}
		hole
	}

	fn queue_reclaim(&mut self, id: EntryId, purging: Purging) {
		debug_assert!(purging != Purging::None);
		self.live.get_mut(id).purging = purging;
		let deadline = self.now().saturating_add(self.reclaim_delay);
		self.reclaim.push_back(Reclaim { deadline, entry: id });
		self.arm_timer(deadline);
	}

	fn arm_timer(&mut self, deadline: u64) {
		if self.reclaim_delay == 0 || self.timer_armed {
			return;
		}
		if let Some(timer) = &self.timer {
			timer.arm(deadline);
			self.timer_armed = true;
		}
	}

	/// Drains expired reclamations in deadline order. Returns whether any
	/// free left a hole, i.e. did not shrink the allocated end of its file.
	fn check_reclaim(&mut self) -> bool {
		let now = self.now();
		let mut hole = false;
		loop {
			match self.reclaim.front() {
				Some(reclaim) if reclaim.deadline <= now => (),
				_ => break,
			}
			let reclaim = self.reclaim.pop_front().expect("checked above");
			let entry = self.live.remove(reclaim.entry);
			log::trace!(target: "tandem-db", "Reclaiming superseded record of {}", hex(&entry.key));
			let ids = self.index.get_mut(&entry.key[..]).expect("queued records belong to a live key");
			ids.retain(|&id| id != reclaim.entry);
			debug_assert!(!ids.is_empty());
			hole |= !self.entries.free(entry.entry_block);
			if entry.purging == Purging::EntryAndData {
				hole |= !self.data.free(entry.data_block);
			}
		}
		hole
	}

	fn on_timer(&mut self) -> Result<()> {
		if self.closed {
			return Ok(());
		}
		self.timer_armed = false;
		if self.check_reclaim() {
			self.run_compaction()?;
		}
		self.maybe_truncate()?;
		if let Some(front) = self.reclaim.front() {
			let deadline = front.deadline;
			self.arm_timer(deadline);
		}
		Ok(())
	}

	// Runs the two compaction passes, repeating the pair for as long as
	// draining the queue afterwards opens new holes.
	fn run_compaction(&mut self) -> Result<()> {
		loop {
			self.compact_data()?;
			self.compact_entries()?;
			if !self.check_reclaim() {
				break;
			}
		}
		self.maybe_truncate()?;
		Ok(())
	}

	// Walks data blocks from the tail towards the head, relocating each
	// movable block into the earliest gap that fits strictly before it.
	fn compact_data(&mut self) -> Result<()> {
		let summary = self.data.free_gaps();
		let mut max_space = summary.max_space;
		let mut gaps: Vec<GapCursor> = summary
			.gaps
			.into_iter()
			.filter(|gap| gap.space > 0)
			.map(|gap| GapCursor { location: gap.location, space: gap.space, next_block: gap.next_block })
			.collect();
		let mut cursor = self.data.last_block();
		while let Some(block_id) = cursor {
			if gaps.is_empty() {
				break;
			}
			let block = self.data.block(block_id);
			let (start, size, prev, entry_id) = (block.start(), block.size(), block.prev(), *block.payload());
			if start <= gaps[0].location {
				break;
			}
			cursor = prev;
			if self.live.get(entry_id).purging != Purging::None {
				continue;
			}
			if size > max_space {
				continue;
			}
			let target = match gaps.iter().position(|gap| gap.space >= size && gap.location < start) {
				Some(target) => target,
				None => continue,
			};
			let anchor = self.data.block(gaps[target].next_block).prev();
			self.relocate_data(entry_id, gaps[target].location, anchor)?;
			let emptied = {
				let gap = &mut gaps[target];
				gap.location += size;
				gap.space -= size;
				gap.space == 0
			};
			if emptied {
				gaps.remove(target);
			}
			max_space = gaps.iter().map(|gap| gap.space).max().unwrap_or(0);
		}
		Ok(())
	}

	// Rewrites the record at a lower data location under a fresh data
	// version and queues the old copy, which stays valid on disk until the
	// queued free so a crash in between cannot lose the key.
	fn relocate_data(
		&mut self,
		old_id: EntryId,
		destination: u64,
		anchor: Option<BlockId>,
	) -> Result<()> {
		let (key, old_location, size) = {
			let entry = self.live.get(old_id);
			let block = self.data.block(entry.data_block);
			(entry.key.clone(), block.start(), block.size())
		};
		log::trace!(
			target: "tandem-db",
			"Moving data record of {} from {} to {}",
			hex(&key),
			old_location,
			destination,
		);
		let mut data = vec![0u8; size as usize];
		self.data_file().read_at(&mut data, old_location)?;
		let data_version = self.live.get(old_id).data_version.wrapping_add(1);
		let key_size = key.len() as u32;
		let value_size = (size - 1 - key.len() as u64) as u32;
		let new_id = self.live.insert(LiveEntry {
			key: key.clone(),
			entry_block: 0,
			data_block: 0,
			value_location: destination + 1 + key_size as u64,
			data_version,
			purging: Purging::None,
		});
		let data_block = self.data.alloc_after(anchor, size, new_id);
		debug_assert_eq!(self.data.block(data_block).start(), destination);
		let entry_block = self.entries.alloc(ENTRY_SIZE as u64, new_id);
		let entry_location = self.entries.block(entry_block).start();
		{
			let entry = self.live.get_mut(new_id);
			entry.entry_block = entry_block;
			entry.data_block = data_block;
		}
		self.index
			.get_mut(&key[..])
			.expect("moved records belong to a live key")
			.push(new_id);
		let body = EntryRecord {
			data_location: destination,
			data_version,
			key_size,
			value_size,
		}
		.encode();
		let header = EntryRecord::seal(&body, &data);
		self.write_data(&data, destination)?;
		self.data_file().sync()?;
		self.write_entry(&header, &body, entry_location)?;
		self.entries_file().sync()?;
		self.maybe_truncate()?;
		self.queue_reclaim(old_id, Purging::EntryAndData);
		Ok(())
	}

	// Same walk over the entries file. Moving an entry duplicates its exact
	// bytes at the lower location, so only the entry block of the old copy
	// is queued; the data record stays with the new copy.
	fn compact_entries(&mut self) -> Result<()> {
		let summary = self.entries.free_gaps();
		let mut max_space = summary.max_space;
		let mut gaps: Vec<GapCursor> = summary
			.gaps
			.into_iter()
			.filter(|gap| gap.space > 0)
			.map(|gap| GapCursor { location: gap.location, space: gap.space, next_block: gap.next_block })
			.collect();
		let mut cursor = self.entries.last_block();
		while let Some(block_id) = cursor {
			if gaps.is_empty() {
				break;
			}
			let block = self.entries.block(block_id);
			let (start, prev, entry_id) = (block.start(), block.prev(), *block.payload());
			if start <= gaps[0].location {
				break;
			}
			cursor = prev;
			if self.live.get(entry_id).purging != Purging::None {
				continue;
			}
			let size = ENTRY_SIZE as u64;
			if size > max_space {
				continue;
			}
			let target = match gaps.iter().position(|gap| gap.space >= size && gap.location < start) {
				Some(target) => target,
				None => continue,
			};
			let anchor = self.entries.block(gaps[target].next_block).prev();
			self.relocate_entry(entry_id, gaps[target].location, anchor)?;
			let emptied = {
				let gap = &mut gaps[target];
				gap.location += size;
				gap.space -= size;
				gap.space == 0
			};
			if emptied {
				gaps.remove(target);
			}
			max_space = gaps.iter().map(|gap| gap.space).max().unwrap_or(0);
		}
		Ok(())
	}

	fn relocate_entry(
		&mut self,
		old_id: EntryId,
		destination: u64,
		anchor: Option<BlockId>,
	) -> Result<()> {
		let (key, old_location, data_block, value_location, data_version) = {
			let entry = self.live.get(old_id);
			(
				entry.key.clone(),
				self.entries.block(entry.entry_block).start(),
				entry.data_block,
				entry.value_location,
				entry.data_version,
			)
		};
		log::trace!(
			target: "tandem-db",
			"Moving entry of {} from {} to {}",
			hex(&key),
			old_location,
			destination,
		);
		let mut raw = [0u8; ENTRY_SIZE];
		self.entries_file().read_at(&mut raw, old_location)?;
		let new_id = self.live.insert(LiveEntry {
			key: key.clone(),
			entry_block: 0,
			data_block,
			value_location,
			data_version,
			purging: Purging::None,
		});
		let entry_block = self.entries.alloc_after(anchor, ENTRY_SIZE as u64, new_id);
		debug_assert_eq!(self.entries.block(entry_block).start(), destination);
		self.live.get_mut(new_id).entry_block = entry_block;
		*self.data.payload_mut(data_block) = new_id;
		self.index
			.get_mut(&key[..])
			.expect("moved records belong to a live key")
			.push(new_id);
		self.entries_file().write_at(&raw, destination)?;
		self.entries_file().sync()?;
		self.maybe_truncate()?;
		self.queue_reclaim(old_id, Purging::EntryOnly);
		Ok(())
	}

	fn write_data(&mut self, buf: &[u8], location: u64) -> Result<()> {
		self.data_file().write_at(buf, location)?;
		self.data_size = self.data_size.max(location + buf.len() as u64);
		Ok(())
	}

	fn write_entry(&mut self, header: &[u8], body: &[u8], location: u64) -> Result<()> {
		self.entries_file().write_at(header, location)?;
		self.entries_file().write_at(body, location + header.len() as u64)?;
		self.entries_size = self.entries_size.max(location + (header.len() + body.len()) as u64);
		Ok(())
	}

	// The file never needs to reach past the last allocated block; shrink it
	// whenever the allocated end dropped below the last known size.
	fn maybe_truncate(&mut self) -> Result<()> {
		let end = self.entries.allocated_end();
		if end < self.entries_size {
			log::trace!(target: "tandem-db", "Truncating {} to {}", ENTRIES_FILE, end);
			self.entries_file().truncate(end)?;
			self.entries_size = end;
		}
		let end = self.data.allocated_end();
		if end < self.data_size {
			log::trace!(target: "tandem-db", "Truncating {} to {}", DATA_FILE, end);
			self.data_file().truncate(end)?;
			self.data_size = end;
		}
		Ok(())
	}

	fn close(&mut self) -> Result<()> {
		if self.closed {
			return Ok(());
		}
		if let Some(timer) = &self.timer {
			timer.cancel();
		}
		if self.check_reclaim() {
			self.run_compaction()?;
		}
		self.maybe_truncate()?;
		self.entries_file().sync()?;
		self.data_file().sync()?;
		self.closed = true;
		self.entries_file = None;
		self.data_file = None;
		self.lock = None;
		log::debug!(target: "tandem-db", "Closed store");
		Ok(())
	}
}
