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

//! Daemonization: double fork with a status pipe so the launching shell
//! stays attached until startup either succeeds or fails with a visible
//! message, plus the open-files limit raise sized to the object count.

use std::io;
use std::os::unix::io::RawFd;

/// Begins daemonization. The calling (parent) process does not return: it
/// blocks reading the status pipe and exits with the startup outcome once
/// [`end_daemonize`] or [`report_startup_failure`] runs in the grandchild.
///
/// Returns the status-pipe write fd to pass along.
pub fn begin_daemonize() -> io::Result<RawFd> {
    unsafe {
        libc::umask(0);
    }

    // No core files from a daemon holding console data.
    let core = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &core) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }

    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        _parent => {
            // Wait for the grandchild's verdict so messages written to the
            // inherited stderr reach the shell before the prompt returns.
            unsafe {
                libc::close(fds[1]);
            }
            let mut status = 0u8;
            let n = unsafe {
                libc::read(fds[0], &mut status as *mut u8 as *mut libc::c_void, 1)
            };
            let rc = if n == 1 && status != 0 { 1 } else { 0 };
            std::process::exit(rc);
        }
    }
    unsafe {
        libc::close(fds[0]);
    }

    // Session leader with no controlling tty.
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    // Keep the child alive when the session leader exits below; the real
    // handler is installed afterwards.
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // Abdicate session leadership so a controlling tty can never be
    // re-acquired.
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        _parent => std::process::exit(0),
    }

    Ok(fds[1])
}

/// Completes daemonization: detaches from the filesystem and the inherited
/// std descriptors, then releases the launching shell.
pub fn end_daemonize(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::chdir(b"/\0".as_ptr() as *const libc::c_char) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let devnull = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR) };
    if devnull < 0 {
        return Err(io::Error::last_os_error());
    }
    for std_fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(devnull, std_fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    unsafe {
        libc::close(devnull);
    }

    // EOF on the status pipe tells the waiting parent that startup worked.
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
    Ok(())
}

/// Reports startup failure through the status pipe so the parent exits
/// non-zero after the error message reached stderr.
pub fn report_startup_failure(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::write(fd, [1u8].as_ptr() as *const libc::c_void, 1);
            libc::close(fd);
        }
    }
}

/// Raises the open-files soft limit to cover two descriptors per object.
/// Failure to raise is reported, not fatal.
pub fn raise_fd_limit(object_count: usize) {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } < 0 {
        log::error!(
            "Unable to get the open file limit: {}",
            io::Error::last_os_error()
        );
        return;
    }
    let wanted = (limit.rlim_max).max(object_count as libc::rlim_t * 2);
    if limit.rlim_cur >= wanted {
        return;
    }
    limit.rlim_cur = wanted;
    limit.rlim_max = wanted;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } < 0 {
        log::error!("Unable to set the open file limit to {wanted}");
    } else {
        log::info!("Increased the open file limit to {wanted}");
    }
}
