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

//! The multiplexor loop. Each tick rebuilds the fd interest set from the
//! object arena, waits on the unified readiness-and-timer service, accepts
//! pending clients, drives the read/write engine and acts on its verdicts,
//! then dispatches expired timers and drains the control channel. This
//! thread is the only one that touches object buffers or the master list.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{FromRawFd, RawFd};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use crate::client::{AccessMode, RequestedMode};
use crate::config::{Config, ConfigError, DeviceSpec, ServerOptions};
use crate::control::{self, Controller, Ctl, TimerEvent};
use crate::engine::{read_from_obj, write_to_obj, Verdict};
use crate::logfile::{self, Logfile};
use crate::object::{Listener, ObjId, ObjKind, ObjSet, Object, Process};
use crate::serial::Serial;
use crate::telnet::{self, ConState, ConnectOutcome, Telnet};
use crate::tpoll::{Events, TimerId, TimerIdSource, Tpoll};
use crate::{daemon, logging, signals, timestr};

/// Cap on a single poll wait, so coarse timers still fire promptly.
const TICK: Duration = Duration::from_secs(1);

/// Listen backlog for the client socket.
const LISTEN_BACKLOG: libc::c_int = 10;

#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum StartError {
    /// unable to bind port {0}: {1}
    Bind(u16, io::Error),

    /// unable to resolve console "{0}" peer <{1}>: {2}
    Resolve(String, String, io::Error),

    /// unable to open logfile for console [{0}]: {1}
    Logfile(String, logfile::OpenError),

    /// unable to open daemon logfile: {0}
    DaemonLog(logfile::OpenError),

    /// {0}
    #[from]
    Config(ConfigError),

    /// {0}
    #[from]
    Io(io::Error),
}

/// The multiplexor: the object arena plus everything one tick touches.
pub struct Mux {
    options: ServerOptions,
    objs: ObjSet,
    tp: Tpoll<TimerEvent>,
    listener: ObjId,
    controller: Controller,
    ctl_recv: chan::Receiver<Ctl>,
    /// Controller waker pipe, read end.
    ctl_fd: RawFd,
    /// Signal self-pipe, read end.
    sig_fd: RawFd,
    /// Intended wall-clock instant of the next logfile timestamp.
    tstamp_next: Option<libc::time_t>,
    fired: Vec<(TimerId, TimerEvent)>,
}

impl Mux {
    /// Builds the object set from the configuration and binds the listening
    /// socket. Descriptor-opening for consoles and logfiles happens later in
    /// [`Self::open_objs`].
    pub fn new(config: &Config, sig_fd: RawFd) -> Result<Self, StartError> {
        let ids = TimerIdSource::default();
        let (controller, ctl_recv, ctl_fd) = control::channel(ids.clone())?;

        let mut objs = build_objects(config)?;
        let listener = bind_listener(&config.server, &mut objs)?;

        Ok(Mux {
            options: config.server.clone(),
            objs,
            tp: Tpoll::new(ids),
            listener,
            controller,
            ctl_recv,
            ctl_fd,
            sig_fd,
            tstamp_next: None,
            fired: vec![],
        })
    }

    pub fn controller(&self) -> Controller { self.controller.clone() }

    /// The port actually bound, after any port-0 ephemeral assignment.
    pub fn local_port(&self) -> u16 {
        match self.objs.get(self.listener).map(|o| &o.kind) {
            Some(ObjKind::Listener(l)) => l.port,
            _ => 0,
        }
    }

    pub fn console_count(&self) -> usize {
        self.objs.iter().filter(|o| o.is_console()).count()
    }

    /// Initially opens every console and logfile object. Telnet consoles
    /// start their non-blocking connects; serial or telnet failures leave
    /// the console down (with a reconnect scheduled for telnet), while a
    /// logfile failure is fatal at startup.
    pub fn open_objs(&mut self) -> Result<(), StartError> {
        daemon::raise_fd_limit(self.objs.len());

        for id in self.objs.ids() {
            let obj = self.objs.get_mut(id).expect("fresh id snapshot");
            if obj.is_serial() {
                let result = match &mut obj.kind {
                    ObjKind::Serial(ser) => ser.open(),
                    _ => unreachable!(),
                };
                match result {
                    Ok(fd) => obj.fd = fd,
                    Err(err) => log::error!(
                        "Unable to open serial console [{}]: {err}; console stays down",
                        obj.name
                    ),
                }
            } else if obj.is_telnet() {
                if let ConnectOutcome::Failed(delay) = telnet::connect(obj) {
                    self.schedule_reconnect(id, delay);
                }
            } else if obj.is_logfile() {
                let name = obj.name.clone();
                let result = match &mut obj.kind {
                    ObjKind::Logfile(lf) => lf.open(),
                    _ => unreachable!(),
                };
                match result {
                    Ok(fd) => obj.fd = fd,
                    Err(err) => return Err(StartError::Logfile(name, err)),
                }
            }
        }
        Ok(())
    }

    /// Runs ticks until the orderly-shutdown flag is set, then tears every
    /// object down, the listener last.
    pub fn run(&mut self) -> io::Result<()> {
        if self.options.timestamp_minutes > 0 {
            self.schedule_timestamp();
        }

        while !signals::done() {
            if signals::take_reconfig() {
                self.reconfig();
            }

            self.spawn_pending_resets();
            self.register_interest();

            match self.tp.wait(TICK) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!("Unable to multiplex I/O: {err}");
                    return Err(err);
                }
            }

            let listener_fd = self.objs.get(self.listener).map(|o| o.fd).unwrap_or(-1);
            if listener_fd >= 0 && self.tp.is_set(listener_fd, Events::IN) {
                self.accept_clients(listener_fd);
            }

            self.dispatch_io();
            self.dispatch_timers();

            if self.tp.is_set(self.sig_fd, Events::IN) {
                control::drain(self.sig_fd);
            }
            if self.tp.is_set(self.ctl_fd, Events::IN) {
                control::drain(self.ctl_fd);
            }
            if !self.drain_ctl() {
                break;
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Interest registration per tick: readable consoles and clients,
    /// writable whatever has buffered output or a drain to finish, both for
    /// telnet connects in flight. Objects with fd -1 are timer-driven and
    /// stay out of the set.
    fn register_interest(&mut self) {
        self.tp.zero_fds();
        self.tp.set(self.sig_fd, Events::IN);
        self.tp.set(self.ctl_fd, Events::IN);

        for id in self.objs.ids() {
            let obj = self.objs.get(id).expect("fresh id snapshot");
            if obj.fd < 0 {
                continue;
            }
            let events = interest_of(obj);
            if !events.is_empty() {
                self.tp.set(obj.fd, events);
            }
        }
    }

    /// Spawns the reset subshell for every console whose reset flag was
    /// raised since the last tick.
    fn spawn_pending_resets(&mut self) {
        let pending: Vec<ObjId> = self
            .objs
            .iter()
            .filter(|o| o.got_reset)
            .map(|o| o.id)
            .collect();
        for id in pending {
            self.reset_console(id);
        }
    }

    fn dispatch_io(&mut self) {
        for id in self.objs.ids() {
            let Some(obj) = self.objs.get(id) else {
                continue;
            };
            // The listener is served by the accept phase.
            if matches!(obj.kind, ObjKind::Listener(_)) {
                continue;
            }
            let fd = obj.fd;
            if fd < 0 {
                continue;
            }

            if obj.telnet().map(|t| t.state == ConState::Pending).unwrap_or(false) {
                if self.tp.is_set(fd, Events::read_ready() | Events::OUT) {
                    let obj = self.objs.get_mut(id).expect("object just looked up");
                    if let ConnectOutcome::Failed(delay) = telnet::advance(obj) {
                        self.schedule_reconnect(id, delay);
                    }
                }
                continue;
            }

            if self.tp.is_set(fd, Events::read_ready()) {
                match read_from_obj(&mut self.objs, id) {
                    Verdict::Ok => {}
                    Verdict::Dispose => {
                        self.objs.destroy(id);
                        continue;
                    }
                    Verdict::Reconnect => {
                        self.reconnect(id);
                        continue;
                    }
                }
            }

            let Some(obj) = self.objs.get(id) else {
                continue;
            };
            if obj.fd >= 0 && self.tp.is_set(obj.fd, Events::OUT) {
                match write_to_obj(&mut self.objs, id) {
                    Verdict::Ok => {}
                    Verdict::Dispose => self.objs.destroy(id),
                    Verdict::Reconnect => self.reconnect(id),
                }
            }
        }
    }

    /// Timer dispatch happens after the fd phase of the tick, in deadline
    /// order; cancelled expiries fail their validity claim and are skipped.
    fn dispatch_timers(&mut self) {
        let mut fired = mem::take(&mut self.fired);
        fired.clear();
        self.tp.expired(&mut fired);
        for (tid, event) in fired.drain(..) {
            if !self.tp.timer_claim(tid) {
                continue;
            }
            match event {
                TimerEvent::Timestamp => self.timestamp_logfiles(),
                TimerEvent::Reconnect(id) => self.retry_connect(id),
                TimerEvent::ResetKill { pid, console } => self.kill_console_reset(pid, &console),
            }
        }
        self.fired = fired;
    }

    /// Returns `false` when a shutdown request was drained.
    fn drain_ctl(&mut self) -> bool {
        loop {
            match self.ctl_recv.try_recv() {
                Err(chan::TryRecvError::Empty) => return true,
                Err(chan::TryRecvError::Disconnected) => {
                    unreachable!("the loop holds a controller clone")
                }
                Ok(Ctl::SetTimer {
                    id,
                    deadline,
                    event,
                }) => self.tp.timer_insert(id, deadline, event),
                Ok(Ctl::CancelTimer(id)) => self.tp.timer_cancel(id),
                Ok(Ctl::NewClient { obj, console, mode }) => self.admit_client(obj, console, mode),
                Ok(Ctl::Shutdown) => return false,
            }
        }
    }

    /// Accepts every pending connection; each goes to a worker thread for
    /// the greeting handshake before it becomes an object.
    fn accept_clients(&mut self, listener_fd: RawFd) {
        loop {
            let sd = unsafe {
                libc::accept4(
                    listener_fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_CLOEXEC,
                )
            };
            if sd < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) | Some(libc::ECONNABORTED) => return,
                    _ => {
                        // Includes fd exhaustion: report and move on, the
                        // daemon itself survives.
                        log::error!("Unable to accept new connection: {err}");
                        return;
                    }
                }
            }

            if self.options.keepalive {
                let on: libc::c_int = 1;
                unsafe {
                    libc::setsockopt(
                        sd,
                        libc::SOL_SOCKET,
                        libc::SO_KEEPALIVE,
                        &on as *const _ as *const libc::c_void,
                        mem::size_of::<libc::c_int>() as libc::socklen_t,
                    );
                }
            }

            let sock = unsafe { TcpStream::from_raw_fd(sd) };
            if self.options.tcp_wrap && !host_allowed(&sock) {
                log::info!("Rejected connection by host filter");
                continue;
            }

            let controller = self.controller.clone();
            let bufsize = self.options.buffer_size;
            thread::spawn(move || crate::client::process_client(sock, bufsize, &controller));
        }
    }

    /// Wires a promoted client into the arena: resolves its console,
    /// arbitrates the cooperative write lock and queues the reply line.
    fn admit_client(&mut self, mut obj: Object, console: String, mode: RequestedMode) {
        let ident = obj.client().map(|c| c.ident.clone()).unwrap_or_default();

        let Some(console_id) = self.objs.find_console(&console) else {
            log::info!("Client <{ident}> requested unknown console [{console}]");
            obj.outbuf
                .enqueue(format!("ERR unknown console {console}\r\n").as_bytes());
            obj.got_eof = true;
            self.objs.adopt(obj);
            return;
        };

        // Writers currently wired into the console, attach or join alike.
        let holders: Vec<ObjId> = self
            .objs
            .get(console_id)
            .map(|c| c.readers.clone())
            .unwrap_or_default();

        let resolved = match mode {
            RequestedMode::Monitor => AccessMode::Monitor,
            RequestedMode::Join => AccessMode::Join,
            RequestedMode::Attach if holders.is_empty() => AccessMode::Attach,
            RequestedMode::Attach => {
                log::info!("Client <{ident}> refused: console [{console}] is busy");
                obj.outbuf
                    .enqueue(format!("ERR console {console} busy\r\n").as_bytes());
                obj.got_eof = true;
                self.objs.adopt(obj);
                return;
            }
            RequestedMode::Force => {
                for holder in holders {
                    self.steal_write_access(holder, console_id, &ident);
                }
                AccessMode::Attach
            }
        };

        obj.outbuf
            .enqueue(format!("OK {resolved} {console}\r\n").as_bytes());
        let id = self.objs.adopt(obj);
        if let Some(client) = self.objs.get_mut(id).and_then(Object::client_mut) {
            client.console = Some(console_id);
            client.mode = resolved;
        }

        self.objs.subscribe(console_id, id);
        if resolved != AccessMode::Monitor {
            self.objs.subscribe(id, console_id);
        }
        log::info!("Client <{ident}> {resolved}ed console [{console}]");
    }

    fn steal_write_access(&mut self, holder: ObjId, console: ObjId, by: &str) {
        self.objs.unsubscribe(holder, console);
        if let Some(obj) = self.objs.get_mut(holder) {
            obj.outbuf
                .enqueue(format!("[write access taken by <{by}>]\r\n").as_bytes());
            if let Some(client) = obj.client_mut() {
                client.mode = AccessMode::Monitor;
                log::info!("Client <{}> demoted to monitor", client.ident);
            }
        }
    }

    /// A console's connection died: retain the object, go `Down`, schedule
    /// the next attempt on the back-off schedule.
    fn reconnect(&mut self, id: ObjId) {
        let Some(obj) = self.objs.get_mut(id) else {
            return;
        };
        let delay = telnet::drop_connection(obj);
        self.schedule_reconnect(id, delay);
    }

    fn schedule_reconnect(&mut self, id: ObjId, delay: Duration) {
        let timer = self.tp.timer_relative(delay, TimerEvent::Reconnect(id));
        if let Some(tel) = self.objs.get_mut(id).and_then(Object::telnet_mut) {
            debug_assert!(tel.timer.is_none(), "duplicate reconnect timer");
            tel.timer = Some(timer);
        }
    }

    fn retry_connect(&mut self, id: ObjId) {
        let Some(obj) = self.objs.get_mut(id) else {
            return;
        };
        match obj.telnet_mut() {
            Some(tel) if tel.state == ConState::Down => tel.timer = None,
            _ => return,
        }
        if let ConnectOutcome::Failed(delay) = telnet::connect(obj) {
            self.schedule_reconnect(id, delay);
        }
    }

    /// Enqueues the timestamp line into every logfile, then schedules the
    /// next deadline from the intended (not actual) fire time.
    fn timestamp_logfiles(&mut self) {
        let now = timestr::now_t();
        let mut got_logs = false;
        for id in self.objs.ids() {
            let Some(obj) = self.objs.get_mut(id) else {
                continue;
            };
            let Some(console_name) = obj.logfile().map(|lf| lf.console_name.clone()) else {
                continue;
            };
            obj.outbuf
                .enqueue(timestr::stamp_line(&console_name, now).as_bytes());
            got_logs = true;
        }
        if got_logs {
            self.schedule_timestamp();
        }
    }

    fn schedule_timestamp(&mut self) {
        let minutes = self.options.timestamp_minutes;
        debug_assert!(minutes > 0);
        let now = timestr::now_t();
        let next = timestr::next_stamp(self.tstamp_next, now, minutes);
        self.tstamp_next = Some(next);

        let delta = Duration::from_secs((next - now).max(0) as u64);
        self.tp.timer_absolute(Instant::now() + delta, TimerEvent::Timestamp);
    }

    /// Forks the reset subshell for a console and arms its watchdog through
    /// the global controller handle.
    fn reset_console(&mut self, id: ObjId) {
        let Some(obj) = self.objs.get_mut(id) else {
            return;
        };
        obj.got_reset = false;
        let name = obj.name.clone();

        let Some(cmd) = self.options.reset_cmd.clone() else {
            log::info!("Unable to reset console [{name}]: no reset command configured");
            return;
        };
        let cmd = match logfile::expand_template(&cmd, Some(&name)) {
            Ok(cmd) => cmd,
            Err(err) => {
                log::info!("Unable to reset console [{name}]: {err}");
                return;
            }
        };

        match spawn_reset(&cmd) {
            Ok(pid) => {
                let timeout = Duration::from_secs(self.options.reset_timeout_secs);
                self.objs.adopt(Object::new(
                    format!("reset:{name}"),
                    -1,
                    ObjKind::Process(Process {
                        pid,
                        deadline: Instant::now() + timeout,
                    }),
                    16,
                ));
                if let Err(err) = control::global().timer_relative(
                    timeout,
                    TimerEvent::ResetKill {
                        pid,
                        console: name.clone(),
                    },
                ) {
                    log::error!("Unable to create watchdog for console [{name}] reset: {err}");
                }
                log::info!("Resetting console [{name}] (pid {pid})");
            }
            Err(err) => log::info!("Unable to reset console [{name}]: {err}"),
        }
    }

    /// Watchdog expiry: SIGKILL the whole process group if the reset command
    /// outlived its limit, then drop the bookkeeping object.
    fn kill_console_reset(&mut self, pid: libc::pid_t, console: &str) {
        if unsafe { libc::kill(pid, 0) } == 0 && unsafe { libc::kill(-pid, libc::SIGKILL) } == 0 {
            log::info!(
                "Reset of console [{console}] (pid {pid}) exceeded {}s time limit",
                self.options.reset_timeout_secs
            );
        }
        if let Some(id) = self.objs.find_process(pid) {
            self.objs.destroy(id);
        }
    }

    /// SIGHUP path: reopen the daemon logfile and every console logfile in
    /// append mode. With `revive_on_reconfig` the pass also resurrects
    /// downed serial consoles and resets telnet back-off.
    fn reconfig(&mut self) {
        log::info!("Performing reconfig");
        for id in self.objs.ids() {
            let Some(obj) = self.objs.get_mut(id) else {
                continue;
            };
            if !obj.is_logfile() {
                continue;
            }
            let result = match &mut obj.kind {
                ObjKind::Logfile(lf) => lf.open(),
                _ => unreachable!(),
            };
            match result {
                Ok(fd) => {
                    if obj.fd >= 0 {
                        unsafe { libc::close(obj.fd) };
                    }
                    obj.fd = fd;
                }
                Err(err) => log::warn!("Unable to reopen logfile [{}]: {err}", obj.name),
            }
        }
        logging::reopen_daemon_log();

        if self.options.revive_on_reconfig {
            self.revive_consoles();
        }
    }

    /// Optional reconfig extension: reopen downed serial devices and put
    /// downed telnet consoles back on the floor of their back-off schedule.
    fn revive_consoles(&mut self) {
        for id in self.objs.ids() {
            let Some(obj) = self.objs.get_mut(id) else {
                continue;
            };
            if obj.is_serial() && obj.fd < 0 {
                let result = match &mut obj.kind {
                    ObjKind::Serial(ser) => ser.open(),
                    _ => unreachable!(),
                };
                match result {
                    Ok(fd) => obj.fd = fd,
                    Err(err) => {
                        log::warn!("Unable to revive serial console [{}]: {err}", obj.name)
                    }
                }
                continue;
            }
            if !obj.is_telnet() {
                continue;
            }

            let stale_timer = {
                let tel = obj.telnet_mut().expect("kind checked above");
                tel.reset_backoff();
                if tel.state == ConState::Down {
                    tel.timer.take()
                } else {
                    None
                }
            };
            let down = obj
                .telnet()
                .map(|t| t.state == ConState::Down)
                .unwrap_or(false);
            if let Some(timer) = stale_timer {
                self.tp.timer_cancel(timer);
            }
            if down {
                let obj = self.objs.get_mut(id).expect("looked up above");
                if let ConnectOutcome::Failed(delay) = telnet::connect(obj) {
                    self.schedule_reconnect(id, delay);
                }
            }
        }
    }

    /// Orderly teardown: every object goes first, the listener last so the
    /// port is released at the very end.
    fn shutdown(&mut self) {
        log::info!("Shutting down");
        for id in self.objs.ids() {
            if id != self.listener {
                self.objs.destroy(id);
            }
        }
        self.objs.destroy(self.listener);
        unsafe {
            libc::close(self.ctl_fd);
        }
    }
}

/// Which poll bits an object subscribes to this tick. Assumes fd >= 0 (the
/// loop skips closed objects before asking).
pub(crate) fn interest_of(obj: &Object) -> Events {
    let mut events = Events::NONE;
    match &obj.kind {
        ObjKind::Listener(_) | ObjKind::Serial(_) | ObjKind::Client(_) => events |= Events::IN,
        ObjKind::Telnet(tel) => match tel.state {
            ConState::Up => events |= Events::IN,
            ConState::Pending => return Events::IN | Events::OUT,
            ConState::Down => {}
        },
        ObjKind::Logfile(_) | ObjKind::Process(_) => {}
    }
    if (!obj.outbuf.is_empty() || obj.got_eof) && !obj.is_suspended_client() {
        events |= Events::OUT;
    }
    events
}

/// Host-based access filter hook. Always permissive until a policy backend
/// is wired in.
fn host_allowed(_sock: &TcpStream) -> bool { true }

fn build_objects(config: &Config) -> Result<ObjSet, StartError> {
    let mut objs = ObjSet::new();
    let bufsize = config.server.buffer_size;

    for decl in &config.consoles {
        let console = match decl.device()? {
            DeviceSpec::Serial(path) => objs.adopt(Object::new(
                decl.name.clone(),
                -1,
                ObjKind::Serial(Serial::new(path, decl.line_settings()?)),
                bufsize,
            )),
            DeviceSpec::Telnet { host, port } => {
                let addr = (host.as_str(), port)
                    .to_socket_addrs()
                    .map_err(|err| {
                        StartError::Resolve(decl.name.clone(), decl.dev.clone(), err)
                    })?
                    .next()
                    .ok_or_else(|| {
                        StartError::Resolve(
                            decl.name.clone(),
                            decl.dev.clone(),
                            io::ErrorKind::NotFound.into(),
                        )
                    })?;
                objs.adopt(Object::new(
                    decl.name.clone(),
                    -1,
                    ObjKind::Telnet(Telnet::new(host, port, addr)),
                    bufsize,
                ))
            }
        };

        if let Some(template) = &decl.log {
            let logfile = objs.adopt(Object::new(
                format!("log:{}", decl.name),
                -1,
                ObjKind::Logfile(Logfile::new(
                    console,
                    decl.name.clone(),
                    template.clone(),
                    config.server.zero_logs,
                )),
                bufsize,
            ));
            objs.subscribe(console, logfile);
        }
    }
    Ok(objs)
}

fn bind_listener(options: &ServerOptions, objs: &mut ObjSet) -> Result<ObjId, StartError> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(StartError::Bind(options.port, io::Error::last_os_error()));
    }
    let close_and = |err: io::Error| {
        unsafe { libc::close(fd) };
        StartError::Bind(options.port, err)
    };

    let on: libc::c_int = 1;
    if unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(close_and(io::Error::last_os_error()));
    }

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = options.port.to_be();
    addr.sin_addr.s_addr = if options.loopback {
        libc::INADDR_LOOPBACK.to_be()
    } else {
        libc::INADDR_ANY.to_be()
    };
    if unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(close_and(io::Error::last_os_error()));
    }
    if unsafe { libc::listen(fd, LISTEN_BACKLOG) } < 0 {
        return Err(close_and(io::Error::last_os_error()));
    }

    // Recover the port for ephemeral binds.
    let mut bound: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    if unsafe {
        libc::getsockname(fd, &mut bound as *mut _ as *mut libc::sockaddr, &mut len)
    } < 0
    {
        return Err(close_and(io::Error::last_os_error()));
    }
    let port = u16::from_be(bound.sin_port);

    log::info!("Listening on port {port}");
    Ok(objs.adopt(Object::new(
        "listen",
        fd,
        ObjKind::Listener(Listener {
            port,
            loopback: options.loopback,
        }),
        64,
    )))
}

/// Forks `/bin/sh -c <cmd>` detached from the daemon's std descriptors.
/// Both sides call `setpgid` so the watchdog can SIGKILL the whole group
/// without racing the exec (APUE §9.4).
pub fn spawn_reset(cmd: &str) -> io::Result<libc::pid_t> {
    let ccmd = CString::new(cmd).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let argv: [*const libc::c_char; 4] = [
        b"sh\0".as_ptr() as *const libc::c_char,
        b"-c\0".as_ptr() as *const libc::c_char,
        ccmd.as_ptr(),
        std::ptr::null(),
    ];

    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => unsafe {
            // Child: async-signal-safe calls only between fork and exec.
            libc::setpgid(0, 0);
            libc::close(libc::STDIN_FILENO);
            libc::close(libc::STDOUT_FILENO);
            libc::close(libc::STDERR_FILENO);
            libc::execv(b"/bin/sh\0".as_ptr() as *const libc::c_char, argv.as_ptr());
            libc::_exit(127);
        },
        pid => {
            unsafe {
                libc::setpgid(pid, pid);
            }
            Ok(pid)
        }
    }
}
