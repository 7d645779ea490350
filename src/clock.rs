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

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};

/// Millisecond wall clock. Injectable so tests can drive reclamation with a
/// virtual clock.
pub trait Clock: Send + Sync {
	fn now(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_millis() as u64)
			.unwrap_or(0)
	}
}

struct TimerState {
	deadline: Option<u64>,
	shutdown: bool,
}

struct TimerShared {
	state: Mutex<TimerState>,
	cv: Condvar,
}

/// Arms and cancels the single-shot reclamation timer.
#[derive(Clone)]
pub(crate) struct TimerControl(Arc<TimerShared>);

impl TimerControl {
	fn new() -> TimerControl {
		TimerControl(Arc::new(TimerShared {
			state: Mutex::new(TimerState { deadline: None, shutdown: false }),
			cv: Condvar::new(),
		}))
	}

	pub fn arm(&self, deadline: u64) {
		let mut state = self.0.state.lock();
		state.deadline = Some(deadline);
		self.0.cv.notify_one();
	}

	pub fn cancel(&self) {
		let mut state = self.0.state.lock();
		state.deadline = None;
		self.0.cv.notify_one();
	}

	pub fn shutdown(&self) {
		let mut state = self.0.state.lock();
		state.shutdown = true;
		self.0.cv.notify_one();
	}
}

/// Background thread that waits for the armed deadline and invokes the
/// reclamation callback as a new top-level call.
pub(crate) struct TimerThread {
	control: TimerControl,
	handle: Option<std::thread::JoinHandle<()>>,
}

impl TimerThread {
	pub fn spawn<F>(clock: Arc<dyn Clock>, mut on_fire: F) -> std::io::Result<TimerThread>
	where
		F: FnMut() + Send + 'static,
	{
		let control = TimerControl::new();
		let shared = control.0.clone();
		let handle = std::thread::Builder::new()
			.name("tandem-db-reclaim".into())
			.spawn(move || loop {
				{
					let mut state = shared.state.lock();
					loop {
						if state.shutdown {
							return;
						}
						match state.deadline {
							None => shared.cv.wait(&mut state),
							Some(deadline) => {
								let now = clock.now();
								if now >= deadline {
									state.deadline = None;
									break;
								}
								let wait = Duration::from_millis(deadline - now);
								let _ = shared.cv.wait_for(&mut state, wait);
							}
						}
					}
				}
				on_fire();
			})?;
		Ok(TimerThread { control, handle: Some(handle) })
	}

	pub fn control(&self) -> TimerControl {
		self.control.clone()
	}
}

impl Drop for TimerThread {
	fn drop(&mut self) {
		self.control.shutdown();
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
	}
}
