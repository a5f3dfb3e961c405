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

//! The signal control plane. Handlers only set word-sized atomic flags and
//! poke a self-pipe that feeds the same poll wait as every other descriptor;
//! all real work happens on the loop thread. SIGCHLD reaps reset-command
//! children with non-blocking wait-any, and SIGPIPE is ignored so peer
//! resets surface as write errors instead of killing the daemon.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static DONE: AtomicBool = AtomicBool::new(false);
static RECONFIG: AtomicBool = AtomicBool::new(false);
static PIPE_WR: AtomicI32 = AtomicI32::new(-1);

/// Orderly-shutdown flag set by SIGINT/SIGTERM.
pub fn done() -> bool { DONE.load(Ordering::Relaxed) }

/// Requests orderly shutdown from the loop thread itself.
pub fn request_done() { DONE.store(true, Ordering::Relaxed); }

/// Consumes the SIGHUP reconfig request, if one is pending.
pub fn take_reconfig() -> bool { RECONFIG.swap(false, Ordering::Relaxed) }

/// Installs all handlers and returns the read end of the signal self-pipe
/// for registration in the poll interest set.
pub fn install() -> io::Result<RawFd> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    PIPE_WR.store(fds[1], Ordering::SeqCst);

    set_handler(libc::SIGINT, on_exit_signal as libc::sighandler_t)?;
    set_handler(libc::SIGTERM, on_exit_signal as libc::sighandler_t)?;
    set_handler(libc::SIGHUP, on_hup as libc::sighandler_t)?;
    set_handler(libc::SIGCHLD, on_chld as libc::sighandler_t)?;
    set_handler(libc::SIGPIPE, libc::SIG_IGN)?;
    Ok(fds[0])
}

fn set_handler(signum: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    sa.sa_sigaction = handler;
    unsafe {
        libc::sigemptyset(&mut sa.sa_mask);
    }
    // No SA_RESTART: the poll wait must come back with EINTR so the loop
    // re-examines the flags.
    sa.sa_flags = 0;
    let rc = unsafe { libc::sigaction(signum, &sa, ptr::null_mut()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

extern "C" fn on_exit_signal(_signum: libc::c_int) {
    DONE.store(true, Ordering::Relaxed);
    poke();
}

extern "C" fn on_hup(_signum: libc::c_int) {
    RECONFIG.store(true, Ordering::Relaxed);
    poke();
}

extern "C" fn on_chld(_signum: libc::c_int) {
    // Non-blocking wait-any; only async-signal-safe calls in here.
    unsafe {
        while libc::waitpid(-1, ptr::null_mut(), libc::WNOHANG) > 0 {}
    }
}

fn poke() {
    let fd = PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, [1u8].as_ptr() as *const libc::c_void, 1);
        }
    }
}
