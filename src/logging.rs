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

//! The daemon's `log` sink: stderr until daemonization, then an append-mode,
//! write-locked logfile which a SIGHUP reconfig reopens (re-expanding the
//! `%D` date). When a reopen fails the daemon goes logless with a warning
//! rather than dying.

use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::logfile::{expand_template, open_locked, OpenError};
use crate::timestr;

enum Output {
    Stderr,
    File(File),
    /// Logfile reopen failed; records are discarded until the next reconfig.
    None,
}

struct Sink {
    out: Output,
    /// Daemon logfile template retained for reopens.
    template: Option<String>,
}

struct DaemonLogger(Mutex<Sink>);

static LOGGER: DaemonLogger = DaemonLogger(Mutex::new(Sink {
    out: Output::Stderr,
    template: None,
}));

impl Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool { metadata.level() <= log::max_level() }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = timestr::now_t();
        let tm = timestr::local_tm(now);
        let line = format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02} {} {}\n",
            tm.tm_year + 1900,
            tm.tm_mon + 1,
            tm.tm_mday,
            tm.tm_hour,
            tm.tm_min,
            tm.tm_sec,
            tag(record.level()),
            record.args()
        );
        let mut sink = self.0.lock().expect("log sink poisoned");
        match &mut sink.out {
            Output::Stderr => {
                let _ = std::io::stderr().write_all(line.as_bytes());
            }
            Output::File(file) => {
                let _ = file.write_all(line.as_bytes());
            }
            Output::None => {}
        }
    }

    fn flush(&self) {}
}

fn tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR:",
        Level::Warn => "WARNING:",
        Level::Info => "INFO:",
        Level::Debug => "DEBUG:",
        Level::Trace => "TRACE:",
    }
}

/// Installs the sink writing to stderr. Called once, before anything logs.
pub fn init(level: LevelFilter) {
    log::set_logger(&LOGGER).expect("logger installed twice");
    log::set_max_level(level);
}

/// Transitions the sink to the daemon logfile. `truncate` applies only to
/// this first open (the zero-logs option); reopens always append.
pub fn open_daemon_log(template: &str, level: LevelFilter, truncate: bool) -> Result<(), OpenError> {
    let file = open_guarded(template, truncate)?;
    let mut sink = LOGGER.0.lock().expect("log sink poisoned");
    sink.template = Some(template.to_owned());
    sink.out = Output::File(file);
    log::set_max_level(level);
    Ok(())
}

/// SIGHUP path: reopens the daemon logfile under its template. On failure
/// the sink goes logless until a later reconfig succeeds.
pub fn reopen_daemon_log() {
    let template = {
        let sink = LOGGER.0.lock().expect("log sink poisoned");
        match &sink.template {
            Some(template) => template.clone(),
            // Still on stderr: nothing to rotate.
            None => return,
        }
    };
    match open_guarded(&template, false) {
        Ok(file) => {
            let mut sink = LOGGER.0.lock().expect("log sink poisoned");
            sink.out = Output::File(file);
        }
        Err(err) => {
            log::warn!("Unable to reopen daemon logfile: {err}");
            let mut sink = LOGGER.0.lock().expect("log sink poisoned");
            sink.out = Output::None;
        }
    }
}

/// Opens the daemon logfile with group/other write access masked off.
fn open_guarded(template: &str, truncate: bool) -> Result<File, OpenError> {
    let path = PathBuf::from(expand_template(template, None)?);
    let mask = unsafe { libc::umask(0) };
    unsafe { libc::umask(mask | 0o022) };
    let result = open_locked(&path, truncate);
    unsafe { libc::umask(mask) };
    let fd = result?;
    Ok(unsafe { File::from_raw_fd(fd) })
}
