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

//! Per-console logfiles: filename template expansion, append-mode opens with
//! an at-most-once truncation, and the advisory write lock that keeps two
//! daemon instances from interleaving one file.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use crate::object::ObjId;
use crate::timestr;

#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum OpenError {
    /// unknown conversion specifier "%{0}" in logfile name
    BadSpecifier(char),

    /// logfile name expands to an empty path
    EmptyPath,

    /// logfile path contains an interior NUL byte
    BadPath,

    /// logfile "{0:?}" is locked by another process
    Locked(PathBuf),

    /// {0}
    #[from]
    Io(io::Error),
}

/// Expands `%N` (console name), `%D` (local date) and `%%` in a filename
/// template. `%N` without a console in scope is an error.
pub fn expand_template(template: &str, console: Option<&str>) -> Result<String, OpenError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('N') => match console {
                Some(name) => out.push_str(name),
                None => return Err(OpenError::BadSpecifier('N')),
            },
            Some('D') => out.push_str(&timestr::date_string(timestr::now_t())),
            Some(other) => return Err(OpenError::BadSpecifier(other)),
            None => return Err(OpenError::BadSpecifier(' ')),
        }
    }
    if out.is_empty() {
        return Err(OpenError::EmptyPath);
    }
    Ok(out)
}

/// Takes an advisory write lock on the whole file. Returns `false` when some
/// other process already holds a conflicting lock.
pub fn write_lock(fd: RawFd) -> io::Result<bool> {
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_WRLCK as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = 0;
    lock.l_len = 0;
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLK, &lock) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EAGAIN) => Ok(false),
        _ => Err(err),
    }
}

/// Opens a path append-mode (optionally truncating), close-on-exec, locked.
pub fn open_locked(path: &PathBuf, truncate: bool) -> Result<RawFd, OpenError> {
    let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| OpenError::BadPath)?;
    let mut flags = libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND | libc::O_CLOEXEC;
    if truncate {
        flags |= libc::O_TRUNC;
    }
    let fd = unsafe { libc::open(cpath.as_ptr(), flags, 0o644 as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    match write_lock(fd) {
        Ok(true) => Ok(fd),
        Ok(false) => {
            unsafe { libc::close(fd) };
            Err(OpenError::Locked(path.clone()))
        }
        Err(err) => {
            unsafe { libc::close(fd) };
            Err(err.into())
        }
    }
}

/// Console logfile state.
#[derive(Debug)]
pub struct Logfile {
    /// The console whose stream this file records.
    pub console: ObjId,
    /// Cached console name for `%N` expansion and timestamp lines.
    pub console_name: String,
    pub template: String,
    /// Path of the last successful expansion/open.
    pub path: PathBuf,
    /// Truncate on the next open; set once at daemon start by the zero-logs
    /// option and cleared after the first successful open.
    truncate: bool,
}

impl Logfile {
    pub fn new(console: ObjId, console_name: String, template: String, zero_logs: bool) -> Self {
        Self {
            console,
            console_name,
            template,
            path: PathBuf::new(),
            truncate: zero_logs,
        }
    }

    /// (Re)opens the logfile, re-expanding the template. Returns the new fd;
    /// the caller owns the old one.
    pub fn open(&mut self) -> Result<RawFd, OpenError> {
        let path = PathBuf::from(expand_template(&self.template, Some(&self.console_name))?);
        let fd = open_locked(&path, self.truncate)?;
        self.truncate = false;
        self.path = path;
        log::info!(
            "Console [{}] logging to \"{}\"",
            self.console_name,
            self.path.display()
        );
        Ok(fd)
    }
}
