// Console management daemon multiplexing serial- and network-attached consoles.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Unified readiness-and-timer service driving the multiplexor loop.
//!
//! Fd interest is rebuilt from scratch every tick ([`Tpoll::zero_fds`] then
//! [`Tpoll::set`]); a single [`Tpoll::wait`] blocks until an fd is ready, the
//! nearest timer expires, or the caller's timeout cap elapses. Timer payloads
//! are collected after the wait and dispatched by the loop itself, never from
//! signal context.

mod timers;

use std::collections::HashMap;
use std::io;
use std::ops;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

pub use timers::{TimerId, TimerIdSource, Timers};

/// Poll event bits, wrapping the raw POSIX mask. The same type expresses the
/// interest unioned into the per-tick set (where [`Tpoll::set`] honours `IN`
/// and `OUT`) and the readiness reported by the last wait, where the kernel
/// may add `ERR` and `HUP`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Events(pub i16);

impl Events {
    pub const NONE: Events = Events(0);
    pub const IN: Events = Events(libc::POLLIN);
    pub const OUT: Events = Events(libc::POLLOUT);
    pub const ERR: Events = Events(libc::POLLERR);
    pub const HUP: Events = Events(libc::POLLHUP);

    /// Readable data or a condition the read path must consume (error,
    /// hang-up).
    pub fn read_ready() -> Events { Events::IN | Events::ERR | Events::HUP }

    pub fn is_empty(self) -> bool { self.0 == 0 }

    /// Bits `poll(2)` accepts in the interest mask; `ERR`/`HUP` are
    /// report-only and always delivered.
    fn interest_bits(self) -> i16 { self.0 & (libc::POLLIN | libc::POLLOUT) }
}

impl ops::BitOr for Events {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self { Events(self.0 | rhs.0) }
}

impl ops::BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0; }
}

/// The timed-poll service: a per-tick fd interest set plus a one-shot timer
/// list sharing a single blocking wait.
pub struct Tpoll<K> {
    fds: Vec<libc::pollfd>,
    index: HashMap<RawFd, usize>,
    timers: Timers<K>,
}

impl<K> Tpoll<K> {
    pub fn new(ids: TimerIdSource) -> Self {
        Self {
            fds: vec![],
            index: empty!(),
            timers: Timers::new(ids),
        }
    }

    /// Clears all fd interest for the coming tick. Timers are untouched.
    pub fn zero_fds(&mut self) {
        self.fds.clear();
        self.index.clear();
    }

    /// Unions the given interest bits into the set for `fd`.
    pub fn set(&mut self, fd: RawFd, events: Events) {
        debug_assert!(fd >= 0, "closed descriptor in the interest set");
        match self.index.get(&fd) {
            Some(&pos) => self.fds[pos].events |= events.interest_bits(),
            None => {
                self.index.insert(fd, self.fds.len());
                self.fds.push(libc::pollfd {
                    fd,
                    events: events.interest_bits(),
                    revents: 0,
                });
            }
        }
    }

    /// Whether `fd` is present in the current interest set.
    pub fn is_registered(&self, fd: RawFd) -> bool { self.index.contains_key(&fd) }

    /// Tests whether any of the given bits fired for `fd` on the last wait.
    pub fn is_set(&self, fd: RawFd, events: Events) -> bool {
        self.index
            .get(&fd)
            .map(|&pos| self.fds[pos].revents & events.0 != 0)
            .unwrap_or(false)
    }

    /// Blocks until a registered fd is ready, the nearest timer expires, or
    /// `cap` elapses, whichever comes first. Returns the number of ready fds.
    ///
    /// An interrupted wait surfaces as [`io::ErrorKind::Interrupted`]; the
    /// caller re-examines its control flags and retries.
    pub fn wait(&mut self, cap: Duration) -> io::Result<usize> {
        let timeout = match self.timers.next_from(Instant::now()) {
            Some(next) => cap.min(next),
            None => cap,
        };
        // Round up so a timer due in a fraction of a millisecond does not
        // spin the loop.
        let mut ms = timeout.as_millis();
        if timeout.subsec_nanos() % 1_000_000 != 0 {
            ms += 1;
        }
        let ms = ms.min(i32::MAX as u128) as i32;

        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                ms,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Schedules a one-shot timer at an absolute deadline.
    pub fn timer_absolute(&mut self, deadline: Instant, key: K) -> TimerId {
        self.timers.register(deadline, key)
    }

    /// Schedules a one-shot timer `delay` from now.
    pub fn timer_relative(&mut self, delay: Duration, key: K) -> TimerId {
        self.timers.register(Instant::now() + delay, key)
    }

    /// Schedules under a pre-allocated id (see [`TimerIdSource`]).
    pub fn timer_insert(&mut self, id: TimerId, deadline: Instant, key: K) {
        self.timers.insert(id, deadline, key);
    }

    /// Best-effort cancellation; races with firing are resolved by the
    /// validity check in [`Self::timer_claim`].
    pub fn timer_cancel(&mut self, id: TimerId) { self.timers.cancel(id); }

    /// Collects timers expired by now, nearest deadline first.
    pub fn expired(&mut self, fired: &mut Vec<(TimerId, K)>) -> usize {
        self.timers.expire(Instant::now(), fired)
    }

    /// Validity check for a collected expiry; consumes the record.
    pub fn timer_claim(&mut self, id: TimerId) -> bool { self.timers.claim(id) }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn readable_and_writable_bits_fire() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tp: Tpoll<()> = Tpoll::new(TimerIdSource::default());

        tp.zero_fds();
        tp.set(a.as_raw_fd(), Events::IN);
        tp.set(b.as_raw_fd(), Events::OUT);

        use std::io::Write;
        (&b).write_all(b"ping").unwrap();

        let n = tp.wait(Duration::from_millis(200)).unwrap();
        assert!(n >= 2);
        assert!(tp.is_set(a.as_raw_fd(), Events::IN));
        assert!(tp.is_set(b.as_raw_fd(), Events::OUT));
        assert!(!tp.is_set(a.as_raw_fd(), Events::ERR | Events::HUP));
    }

    #[test]
    fn set_unions_interest_bits() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut tp: Tpoll<()> = Tpoll::new(TimerIdSource::default());
        tp.zero_fds();
        tp.set(a.as_raw_fd(), Events::IN);
        tp.set(a.as_raw_fd(), Events::OUT);

        let n = tp.wait(Duration::from_millis(200)).unwrap();
        assert_eq!(n, 1);
        assert!(tp.is_set(a.as_raw_fd(), Events::OUT));
    }

    #[test]
    fn zero_fds_clears_interest_but_not_timers() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut tp: Tpoll<u8> = Tpoll::new(TimerIdSource::default());
        tp.set(a.as_raw_fd(), Events::IN);
        tp.timer_relative(Duration::from_millis(1), 7);

        tp.zero_fds();
        assert!(!tp.is_registered(a.as_raw_fd()));

        std::thread::sleep(Duration::from_millis(5));
        let mut fired = Vec::new();
        tp.expired(&mut fired);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, 7);
    }

    #[test]
    fn timer_head_shortens_the_wait() {
        let mut tp: Tpoll<&str> = Tpoll::new(TimerIdSource::default());
        tp.timer_relative(Duration::from_millis(20), "tick");

        let start = Instant::now();
        tp.wait(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        let mut fired = Vec::new();
        while tp.expired(&mut fired) == 0 {
            tp.wait(Duration::from_millis(50)).unwrap();
        }
        assert_eq!(fired[0].1, "tick");
    }
}
