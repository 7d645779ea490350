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

// Free space bookkeeping over `[offset, ∞)`.
//
// Free space is an ordered list of bounded gaps followed by an unbounded
// tail starting at `tail`. Gaps are disjoint and never touch: two adjacent
// allocations separated by zero free bytes belong to the same allocated run.

use std::ops::Range;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Gap {
	start: u64,
	end: u64,
}

pub struct IntervalSet {
	offset: u64,
	gaps: Vec<Gap>,
	tail: u64,
}

impl IntervalSet {
	pub fn new(offset: u64) -> IntervalSet {
		IntervalSet { offset, gaps: Vec::new(), tail: offset }
	}

	/// Lower bound of the unbounded free tail.
	pub fn tail(&self) -> u64 {
		self.tail
	}

	/// Appends an allocation during load. `start` must not precede the tail;
	/// a gap is opened for any bytes skipped over.
	pub fn add(&mut self, start: u64, end: u64) {
		assert!(end > start && start >= self.tail);
		if start > self.tail {
			self.gaps.push(Gap { start: self.tail, end: start });
		}
		self.tail = end;
	}

	/// First-fit allocation: the first gap that holds `size` bytes, or the
	/// tail when no bounded gap fits. A gap filled exactly is removed.
	pub fn alloc(&mut self, size: u64) -> u64 {
		assert!(size > 0);
		for i in 0..self.gaps.len() {
			let gap = self.gaps[i];
			if gap.end - gap.start >= size {
				if gap.end - gap.start == size {
					self.gaps.remove(i);
				} else {
					self.gaps[i].start += size;
				}
				return gap.start;
			}
		}
		let start = self.tail;
		self.tail += size;
		start
	}

	/// Carves `[start, end)`, which must be entirely free, out of the gap it
	/// falls in (or out of the tail).
	pub fn reserve(&mut self, start: u64, end: u64) {
		assert!(end > start);
		if start >= self.tail {
			if start > self.tail {
				self.gaps.push(Gap { start: self.tail, end: start });
			}
			self.tail = end;
			return;
		}
		let i = self
			.gaps
			.iter()
			.position(|gap| gap.start <= start && end <= gap.end)
			.expect("reserved interval must be free");
		let gap = self.gaps[i];
		match (gap.start < start, end < gap.end) {
			(false, false) => {
				self.gaps.remove(i);
			}
			(false, true) => self.gaps[i].start = end,
			(true, false) => self.gaps[i].end = start,
			(true, true) => {
				self.gaps[i].end = start;
				self.gaps.insert(i + 1, Gap { start: end, end: gap.end });
			}
		}
	}

	/// Returns `[start, end)` to the free set, merging with adjacent gaps.
	/// When the freed interval coalesces with the tail the new tail lower
	/// bound is returned; otherwise the allocated end did not move.
	pub fn free(&mut self, start: u64, end: u64) -> Option<u64> {
		assert!(end > start && start >= self.offset && end <= self.tail);
		if end == self.tail {
			let mut tail = start;
			if let Some(last) = self.gaps.last() {
				if last.end == start {
					tail = last.start;
					self.gaps.pop();
				}
			}
			self.tail = tail;
			return Some(tail);
		}
		let i = self.gaps.partition_point(|gap| gap.end <= start);
		debug_assert!(i >= self.gaps.len() || self.gaps[i].start >= end);
		let merge_left = i > 0 && self.gaps[i - 1].end == start;
		let merge_right = i < self.gaps.len() && self.gaps[i].start == end;
		match (merge_left, merge_right) {
			(true, true) => {
				self.gaps[i - 1].end = self.gaps[i].end;
				self.gaps.remove(i);
			}
			(true, false) => self.gaps[i - 1].end = end,
			(false, true) => self.gaps[i].start = start,
			(false, false) => self.gaps.insert(i, Gap { start, end }),
		}
		None
	}

	/// Complement of the gap list over `[0, tail)`. Bytes below `offset` are
	/// reported as allocated, merged with the first run when it starts at
	/// `offset`.
	pub fn allocated_ranges(&self) -> Vec<Range<u64>> {
		let mut ranges = Vec::new();
		let mut cursor = 0;
		for gap in &self.gaps {
			if gap.start > cursor {
				ranges.push(cursor..gap.start);
			}
			cursor = gap.end;
		}
		if self.tail > cursor {
			ranges.push(cursor..self.tail);
		}
		ranges
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn gaps(set: &IntervalSet) -> Vec<(u64, u64)> {
		set.gaps.iter().map(|gap| (gap.start, gap.end)).collect()
	}

	#[test]
	fn alloc_from_empty_extends_tail() {
		let mut set = IntervalSet::new(4);
		assert_eq!(set.alloc(10), 4);
		assert_eq!(set.alloc(6), 14);
		assert_eq!(set.tail(), 20);
		assert_eq!(set.allocated_ranges(), vec![0..20]);
	}

	#[test]
	fn add_opens_gap_for_skipped_bytes() {
		let mut set = IntervalSet::new(4);
		set.add(4, 10);
		set.add(10, 16);
		set.add(30, 40);
		assert_eq!(gaps(&set), vec![(16, 30)]);
		assert_eq!(set.tail(), 40);
		assert_eq!(set.allocated_ranges(), vec![0..16, 30..40]);
	}

	#[test]
	fn alloc_is_first_fit() {
		let mut set = IntervalSet::new(0);
		set.add(0, 10);
		set.add(20, 30);
		set.add(35, 45);
		assert_eq!(set.alloc(4), 10);
		assert_eq!(set.alloc(5), 30);
		assert_eq!(set.alloc(7), 45);
		assert_eq!(gaps(&set), vec![(14, 20)]);
	}

	#[test]
	fn exact_fill_removes_gap() {
		let mut set = IntervalSet::new(0);
		set.add(0, 10);
		set.add(16, 20);
		assert_eq!(set.alloc(6), 10);
		assert!(gaps(&set).is_empty());
		assert_eq!(set.allocated_ranges(), vec![0..20]);
	}

	#[test]
	fn free_then_alloc_reuses_start() {
		let mut set = IntervalSet::new(0);
		set.add(0, 10);
		set.add(10, 20);
		set.add(20, 30);
		assert_eq!(set.free(10, 20), None);
		assert_eq!(set.alloc(10), 10);
	}

	#[test]
	fn free_merges_with_preceding_gap() {
		let mut set = IntervalSet::new(0);
		set.add(0, 10);
		set.add(14, 20);
		set.add(20, 30);
		assert_eq!(set.free(14, 20), None);
		assert_eq!(gaps(&set), vec![(10, 20)]);
	}

	#[test]
	fn free_merges_with_following_gap() {
		let mut set = IntervalSet::new(0);
		set.add(0, 6);
		set.add(6, 10);
		set.add(14, 20);
		assert_eq!(set.free(6, 10), None);
		assert_eq!(gaps(&set), vec![(6, 14)]);
	}

	#[test]
	fn free_bridges_two_gaps() {
		let mut set = IntervalSet::new(0);
		set.add(0, 4);
		set.add(8, 12);
		set.add(16, 20);
		set.add(20, 24);
		assert_eq!(set.free(8, 12), None);
		assert_eq!(gaps(&set), vec![(4, 16)]);
		assert_eq!(set.allocated_ranges(), vec![0..4, 16..24]);
	}

	#[test]
	fn free_at_tail_returns_new_bound() {
		let mut set = IntervalSet::new(4);
		set.add(4, 10);
		set.add(10, 20);
		assert_eq!(set.free(10, 20), Some(10));
		assert_eq!(set.tail(), 10);
	}

	#[test]
	fn free_at_tail_merges_three_ways() {
		let mut set = IntervalSet::new(4);
		set.add(4, 10);
		set.add(14, 20);
		assert_eq!(set.free(14, 20), Some(10));
		assert_eq!(set.tail(), 10);
		assert!(gaps(&set).is_empty());
	}

	#[test]
	fn free_everything_returns_to_offset() {
		let mut set = IntervalSet::new(4);
		set.add(4, 40);
		assert_eq!(set.free(4, 40), Some(4));
		assert_eq!(set.tail(), 4);
		assert_eq!(set.allocated_ranges(), vec![0..4]);
	}

	#[test]
	fn reserve_carves_gap() {
		let mut set = IntervalSet::new(0);
		set.add(0, 4);
		set.add(20, 24);
		set.reserve(8, 12);
		assert_eq!(gaps(&set), vec![(4, 8), (12, 20)]);
		set.reserve(4, 8);
		set.reserve(12, 20);
		assert!(gaps(&set).is_empty());
	}

	#[test]
	fn reserve_beyond_tail_opens_gap() {
		let mut set = IntervalSet::new(4);
		set.add(4, 10);
		set.reserve(14, 20);
		assert_eq!(gaps(&set), vec![(10, 14)]);
		assert_eq!(set.tail(), 20);
	}

	#[test]
	fn allocated_ranges_track_random_history() {
		let mut set = IntervalSet::new(4);
		let a = set.alloc(10);
		let b = set.alloc(10);
		let c = set.alloc(10);
		assert_eq!((a, b, c), (4, 14, 24));
		set.free(b, b + 10);
		assert_eq!(set.allocated_ranges(), vec![0..14, 24..34]);
		assert_eq!(set.alloc(10), b);
		assert_eq!(set.allocated_ranges(), vec![0..34]);
	}

	#[test]
	fn offset_reported_when_first_block_detached() {
		let mut set = IntervalSet::new(4);
		set.add(8, 12);
		assert_eq!(set.allocated_ranges(), vec![0..4, 8..12]);
	}
}
