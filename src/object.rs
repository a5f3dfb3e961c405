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

//! The object arena. Every endpoint the multiplexor drives (the listening
//! socket, client connections, serial devices, telnet consoles, logfiles and
//! reset subprocesses) is an [`Object`] with a stable [`ObjId`], a pair of
//! ring buffers and non-owning peer links to the objects it exchanges bytes
//! with.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::time::Instant;

use crate::client::Client;
use crate::logfile::Logfile;
use crate::ring::RingBuf;
use crate::serial::Serial;
use crate::telnet::Telnet;

/// Stable object identity. Ids are allocated monotonically by [`ObjSet`] and
/// never reused; peer lists reference objects by id, not by ownership.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display(inner)]
pub struct ObjId(u64);

impl ObjId {
    /// Placeholder carried by objects built outside the arena (a promoted
    /// client constructed in a handshake worker) until adoption.
    pub const UNSET: ObjId = ObjId(0);
}

#[cfg(test)]
impl ObjId {
    pub(crate) fn test(n: u64) -> Self { ObjId(n) }
}

/// Listening-socket state.
#[derive(Debug)]
pub struct Listener {
    pub port: u16,
    pub loopback: bool,
}

/// A reset-command subprocess under watchdog supervision. Never polled
/// (fd stays -1); the pid doubles as the process-group id to SIGKILL.
#[derive(Debug)]
pub struct Process {
    pub pid: libc::pid_t,
    pub deadline: Instant,
}

#[derive(Debug)]
pub enum ObjKind {
    Listener(Listener),
    Client(Client),
    Serial(Serial),
    Telnet(Telnet),
    Logfile(Logfile),
    Process(Process),
}

impl ObjKind {
    fn label(&self) -> &'static str {
        match self {
            ObjKind::Listener(_) => "listener",
            ObjKind::Client(_) => "client",
            ObjKind::Serial(_) => "serial",
            ObjKind::Telnet(_) => "telnet",
            ObjKind::Logfile(_) => "logfile",
            ObjKind::Process(_) => "process",
        }
    }
}

/// A named, buffered endpoint.
#[derive(Debug)]
pub struct Object {
    pub id: ObjId,
    pub name: String,
    /// Open descriptor, or -1 while closed / awaiting reconnect. An object
    /// with fd >= 0 is registered in the poll interest set every tick.
    pub fd: RawFd,
    pub inbuf: RingBuf,
    pub outbuf: RingBuf,
    /// Peer closed the read side; the output buffer still drains before the
    /// object is torn down.
    pub got_eof: bool,
    /// The console has been asked to run its reset command.
    pub got_reset: bool,
    /// Peers feeding bytes into this object, in subscription order.
    pub readers: Vec<ObjId>,
    /// Peers draining this object's input stream, in subscription order.
    pub writers: Vec<ObjId>,
    pub kind: ObjKind,
}

impl Object {
    /// Builds an object awaiting adoption into an [`ObjSet`], which assigns
    /// the real id.
    pub fn new(name: impl Into<String>, fd: RawFd, kind: ObjKind, bufsize: usize) -> Self {
        Object {
            id: ObjId::UNSET,
            name: name.into(),
            fd,
            inbuf: RingBuf::new(bufsize),
            outbuf: RingBuf::new(bufsize),
            got_eof: false,
            got_reset: false,
            readers: vec![],
            writers: vec![],
            kind,
        }
    }

    pub fn is_serial(&self) -> bool { matches!(self.kind, ObjKind::Serial(_)) }

    pub fn is_telnet(&self) -> bool { matches!(self.kind, ObjKind::Telnet(_)) }

    pub fn is_client(&self) -> bool { matches!(self.kind, ObjKind::Client(_)) }

    pub fn is_logfile(&self) -> bool { matches!(self.kind, ObjKind::Logfile(_)) }

    pub fn is_console(&self) -> bool { self.is_serial() || self.is_telnet() }

    pub fn client(&self) -> Option<&Client> {
        match &self.kind {
            ObjKind::Client(c) => Some(c),
            _ => None,
        }
    }

    pub fn client_mut(&mut self) -> Option<&mut Client> {
        match &mut self.kind {
            ObjKind::Client(c) => Some(c),
            _ => None,
        }
    }

    pub fn telnet(&self) -> Option<&Telnet> {
        match &self.kind {
            ObjKind::Telnet(t) => Some(t),
            _ => None,
        }
    }

    pub fn telnet_mut(&mut self) -> Option<&mut Telnet> {
        match &mut self.kind {
            ObjKind::Telnet(t) => Some(t),
            _ => None,
        }
    }

    pub fn logfile(&self) -> Option<&Logfile> {
        match &self.kind {
            ObjKind::Logfile(l) => Some(l),
            _ => None,
        }
    }

    pub fn logfile_mut(&mut self) -> Option<&mut Logfile> {
        match &mut self.kind {
            ObjKind::Logfile(l) => Some(l),
            _ => None,
        }
    }

    /// A client whose outbound flow is paused by user command.
    pub fn is_suspended_client(&self) -> bool {
        self.client().map(|c| c.got_suspend).unwrap_or(false)
    }

    /// Closes the descriptor and releases kind-specific resources. Serial
    /// devices get their saved termios restored before close.
    pub fn teardown(&mut self) {
        if self.fd < 0 {
            return;
        }
        if let ObjKind::Serial(ser) = &mut self.kind {
            ser.restore(self.fd);
        }
        unsafe {
            libc::close(self.fd);
        }
        self.fd = -1;
    }
}

impl Drop for Object {
    fn drop(&mut self) { self.teardown(); }
}

/// Arena of all live objects, keyed by id. Iteration follows creation order
/// since ids are monotonic, starting above [`ObjId::UNSET`].
#[derive(Debug)]
pub struct ObjSet {
    objs: BTreeMap<ObjId, Object>,
    next_id: u64,
}

impl Default for ObjSet {
    fn default() -> Self { Self::new() }
}

impl ObjSet {
    pub fn new() -> Self {
        Self {
            objs: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize { self.objs.len() }

    pub fn is_empty(&self) -> bool { self.objs.is_empty() }

    /// Inserts an object under a fresh id. Also used for objects constructed
    /// elsewhere, like a promoted client from a handshake worker.
    pub fn adopt(&mut self, mut obj: Object) -> ObjId {
        let id = ObjId(self.next_id);
        self.next_id += 1;
        obj.id = id;
        self.objs.insert(id, obj);
        id
    }

    pub fn get(&self, id: ObjId) -> Option<&Object> { self.objs.get(&id) }

    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut Object> { self.objs.get_mut(&id) }

    /// Snapshot of live ids in creation order, safe to iterate while the set
    /// is mutated.
    pub fn ids(&self) -> Vec<ObjId> { self.objs.keys().copied().collect() }

    pub fn iter(&self) -> impl Iterator<Item = &Object> { self.objs.values() }

    pub fn find_console(&self, name: &str) -> Option<ObjId> {
        self.objs
            .values()
            .find(|o| o.is_console() && o.name == name)
            .map(|o| o.id)
    }

    pub fn find_process(&self, pid: libc::pid_t) -> Option<ObjId> {
        self.objs
            .values()
            .find(|o| matches!(&o.kind, ObjKind::Process(p) if p.pid == pid))
            .map(|o| o.id)
    }

    /// Subscribes `sink` to `source`'s input stream: bytes read from
    /// `source` are copied into `sink`'s output buffer.
    pub fn subscribe(&mut self, source: ObjId, sink: ObjId) {
        if let Some(src) = self.objs.get_mut(&source) {
            if !src.writers.contains(&sink) {
                src.writers.push(sink);
            }
        }
        if let Some(snk) = self.objs.get_mut(&sink) {
            if !snk.readers.contains(&source) {
                snk.readers.push(source);
            }
        }
    }

    pub fn unsubscribe(&mut self, source: ObjId, sink: ObjId) {
        if let Some(src) = self.objs.get_mut(&source) {
            src.writers.retain(|w| *w != sink);
        }
        if let Some(snk) = self.objs.get_mut(&sink) {
            snk.readers.retain(|r| *r != source);
        }
    }

    /// Destroys an object: every peer list that may contain it is purged
    /// before its storage is released, then the kind-specific teardown runs.
    pub fn destroy(&mut self, id: ObjId) {
        let Some(mut obj) = self.objs.remove(&id) else {
            return;
        };
        for other in self.objs.values_mut() {
            other.readers.retain(|r| *r != id);
            other.writers.retain(|w| *w != id);
        }
        log::info!("Destroying {} object [{}]", obj.kind.label(), obj.name);
        obj.teardown();
    }
}
