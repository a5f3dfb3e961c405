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

//! Control API into the multiplexor loop: a channel paired with a self-pipe
//! waker, so handshake workers can hand over promoted clients and helpers
//! can schedule timers without threading the tpoll value through every call
//! site. A process-global handle serves the helpers; it is initialized
//! before the loop starts and torn down after it exits.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use crate::client::RequestedMode;
use crate::object::{Object, ObjId};
use crate::tpoll::{TimerId, TimerIdSource};

/// Payload of a timer managed by the loop; dispatched after the fd phase of
/// the tick in which the deadline passed.
#[derive(Debug)]
pub enum TimerEvent {
    /// Write the periodic timestamp line into every logfile.
    Timestamp,
    /// Retry the connect of a downed telnet console.
    Reconnect(ObjId),
    /// Reset-command watchdog: SIGKILL the process group if still alive.
    ResetKill { pid: libc::pid_t, console: String },
}

/// Messages into the multiplexor loop.
pub enum Ctl {
    /// A handshake worker promoted an accepted socket into a client object.
    NewClient {
        obj: Object,
        console: String,
        mode: RequestedMode,
    },
    SetTimer {
        id: TimerId,
        deadline: Instant,
        event: TimerEvent,
    },
    CancelTimer(TimerId),
    /// Finish the current tick, tear every object down and leave the loop.
    Shutdown,
}

/// Cloneable handle to the loop: sends enqueue a message and poke the
/// self-pipe so the poll wait returns promptly.
#[derive(Clone)]
pub struct Controller {
    ctl_send: chan::Sender<Ctl>,
    waker_wr: RawFd,
    ids: TimerIdSource,
}

impl Controller {
    pub fn send(&self, ctl: Ctl) -> io::Result<()> {
        self.ctl_send
            .send(ctl)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        wake(self.waker_wr)
    }

    /// Schedules a one-shot timer `delay` from now, returning its id
    /// immediately; the loop registers it when the message drains.
    pub fn timer_relative(&self, delay: Duration, event: TimerEvent) -> io::Result<TimerId> {
        self.timer_absolute(Instant::now() + delay, event)
    }

    pub fn timer_absolute(&self, deadline: Instant, event: TimerEvent) -> io::Result<TimerId> {
        let id = self.ids.next();
        self.send(Ctl::SetTimer {
            id,
            deadline,
            event,
        })?;
        Ok(id)
    }

    /// Best-effort cancellation; resolved against firing by the loop's
    /// validity check.
    pub fn timer_cancel(&self, id: TimerId) -> io::Result<()> { self.send(Ctl::CancelTimer(id)) }

    /// Initiates orderly shutdown of the multiplexor.
    pub fn shutdown(&self) -> io::Result<()> { self.send(Ctl::Shutdown) }
}

/// Creates the control channel plus its waker pipe. Returns the controller,
/// the receiving side for the loop, and the waker read end the loop registers
/// in its interest set every tick.
pub fn channel(ids: TimerIdSource) -> io::Result<(Controller, chan::Receiver<Ctl>, RawFd)> {
    let (ctl_send, ctl_recv) = chan::unbounded();
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let controller = Controller {
        ctl_send,
        waker_wr: fds[1],
        ids,
    };
    Ok((controller, ctl_recv, fds[0]))
}

/// One byte into the self-pipe; a full pipe already guarantees a wakeup.
fn wake(fd: RawFd) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::write(fd, [1u8].as_ptr() as *const libc::c_void, 1) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Ok(()),
            _ => return Err(err),
        }
    }
}

/// Empties a waker or signal pipe after its readability woke the loop.
pub fn drain(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc <= 0 {
            return;
        }
    }
}

static GLOBAL: Mutex<Option<Controller>> = Mutex::new(None);

/// Installs the process-global controller handle. Called exactly once from
/// the main setup path before the loop starts.
pub fn init_global(controller: Controller) {
    let mut slot = GLOBAL.lock().expect("controller registry poisoned");
    debug_assert!(slot.is_none(), "global controller initialized twice");
    *slot = Some(controller);
}

/// The process-global controller.
///
/// # Panics
///
/// Panics when called outside the init/teardown window.
pub fn global() -> Controller {
    GLOBAL
        .lock()
        .expect("controller registry poisoned")
        .clone()
        .expect("global controller used before initialization")
}

/// Drops the global handle. Called exactly once after the loop exits.
pub fn teardown_global() {
    let mut slot = GLOBAL.lock().expect("controller registry poisoned");
    *slot = None;
}
