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

//! The read/write engine: one non-blocking syscall per object per tick,
//! kind-specific input filtering, and fan-out of every source's stream into
//! the output buffers of its writer peers. The engine only reports verdicts;
//! the loop is the sole place that mutates the master object list.

use std::io;

use crate::client::scan_escapes;
use crate::object::{ObjId, ObjKind, ObjSet};
use crate::telnet::filter_iac;

/// What the loop should do with an object after an I/O pass.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Verdict {
    /// Keep the object as is.
    Ok,
    /// Remove the object from the master list and tear it down.
    Dispose,
    /// Telnet console lost its connection: retain the object, transition it
    /// to `Down` and schedule a reconnect.
    Reconnect,
}

/// Largest single read, bounded so one chatty console cannot monopolize a
/// tick.
const READ_CHUNK: usize = 4096;

fn fail_verdict(is_telnet: bool) -> Verdict {
    if is_telnet {
        Verdict::Reconnect
    } else {
        Verdict::Dispose
    }
}

/// Issues one non-blocking read and distributes whatever arrives.
pub fn read_from_obj(objs: &mut ObjSet, id: ObjId) -> Verdict {
    let mut fan: Vec<u8> = Vec::new();
    let mut reset_target: Option<ObjId> = None;
    let source_name;

    {
        let Some(obj) = objs.get_mut(id) else {
            return Verdict::Ok;
        };
        debug_assert!(obj.fd >= 0);
        source_name = obj.name.clone();

        let mut chunk = [0u8; READ_CHUNK];
        let n = unsafe {
            libc::read(obj.fd, chunk.as_mut_ptr() as *mut libc::c_void, READ_CHUNK)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Verdict::Ok,
                _ => {
                    log::info!("Unable to read from [{}]: {err}", obj.name);
                    fail_verdict(obj.is_telnet())
                }
            };
        }
        if n == 0 {
            obj.got_eof = true;
            if obj.is_telnet() {
                log::info!("Console [{}] peer closed the connection", obj.name);
                return Verdict::Reconnect;
            }
            if obj.outbuf.is_empty() {
                return Verdict::Dispose;
            }
            // Drain-then-close: the write path disposes once empty.
            return Verdict::Ok;
        }

        // Stage through the input ring so a contiguous view is handed to the
        // kind-specific filter.
        obj.inbuf.enqueue(&chunk[..n as usize]);
        let staged = obj.inbuf.drain();

        match &mut obj.kind {
            ObjKind::Telnet(tel) => {
                let mut reply = Vec::new();
                filter_iac(&mut tel.iac, &staged, &mut fan, &mut reply);
                if !reply.is_empty() {
                    obj.outbuf.enqueue(&reply);
                }
            }
            ObjKind::Client(client) => {
                let actions = scan_escapes(&mut client.esc, &staged);
                if actions.suspend_toggle {
                    client.got_suspend = !client.got_suspend;
                    log::debug!(
                        "Client <{}> {} console output",
                        client.ident,
                        if client.got_suspend { "suspended" } else { "resumed" }
                    );
                }
                let can_write = client.mode != crate::client::AccessMode::Monitor;
                if actions.reset && can_write {
                    reset_target = client.console;
                }
                if actions.quit {
                    log::info!("Client <{}> disconnected on command", client.ident);
                    return Verdict::Dispose;
                }
                if can_write {
                    fan = actions.data;
                }
            }
            _ => fan = staged,
        }
    }

    if let Some(console) = reset_target {
        if let Some(obj) = objs.get_mut(console) {
            obj.got_reset = true;
        }
    }
    if !fan.is_empty() {
        fan_out(objs, id, &source_name, &fan);
    }
    Verdict::Ok
}

/// Copies `data` into the output buffer of every writer peer, in
/// subscription order. A slow peer drops (oldest first) rather than stalls;
/// the drop is logged once per overrun burst.
fn fan_out(objs: &mut ObjSet, source: ObjId, source_name: &str, data: &[u8]) {
    let sinks = match objs.get(source) {
        Some(obj) => obj.writers.clone(),
        None => return,
    };
    for sink in sinks {
        let Some(obj) = objs.get_mut(sink) else {
            continue;
        };
        let r = obj.outbuf.enqueue(data);
        if r.first_of_burst {
            log::warn!(
                "Overrun on [{}]: dropped {} bytes of [{source_name}] output",
                obj.name,
                r.dropped
            );
        }
    }
}

/// Issues one non-blocking write from the output buffer.
pub fn write_to_obj(objs: &mut ObjSet, id: ObjId) -> Verdict {
    let Some(obj) = objs.get_mut(id) else {
        return Verdict::Ok;
    };
    debug_assert!(obj.fd >= 0);

    if !obj.outbuf.is_empty() {
        let (ptr, len) = {
            let view = obj.outbuf.view();
            (view.as_ptr(), view.len())
        };
        let n = unsafe { libc::write(obj.fd, ptr as *const libc::c_void, len) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Verdict::Ok,
                _ => {
                    log::info!("Unable to write to [{}]: {err}", obj.name);
                    fail_verdict(obj.is_telnet())
                }
            };
        }
        obj.outbuf.advance(n as usize);
    }

    if obj.outbuf.is_empty() && obj.got_eof {
        // The paired reader finished and the drain completed.
        return fail_verdict(obj.is_telnet());
    }
    Verdict::Ok
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::client::{AccessMode, Client, EscState};
    use crate::object::Object;
    use crate::telnet::{ConState, Telnet, DO, IAC};

    const BUF: usize = 1 << 14;

    /// A connected console stand-in: an UP telnet object over a socketpair.
    fn console(objs: &mut ObjSet, name: &str) -> (ObjId, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let mut tel = Telnet::new(name.into(), 0, "127.0.0.1:1".parse().unwrap());
        tel.state = ConState::Up;
        let obj = Object::new(name, ours.into_raw_fd(), ObjKind::Telnet(tel), BUF);
        (objs.adopt(obj), theirs)
    }

    fn client(objs: &mut ObjSet, name: &str, mode: AccessMode, console: ObjId) -> (ObjId, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let obj = Object::new(
            name,
            ours.into_raw_fd(),
            ObjKind::Client(Client {
                ident: name.into(),
                mode,
                console: Some(console),
                got_suspend: false,
                esc: EscState::Normal,
            }),
            BUF,
        );
        (objs.adopt(obj), theirs)
    }

    #[test]
    fn fans_out_to_every_writer_peer_in_order() {
        let mut objs = ObjSet::new();
        let (src, mut dev) = console(&mut objs, "c1");
        let (c1, mut peer1) = client(&mut objs, "m1", AccessMode::Monitor, src);
        let (c2, mut peer2) = client(&mut objs, "m2", AccessMode::Monitor, src);
        objs.subscribe(src, c1);
        objs.subscribe(src, c2);

        dev.write_all(b"HELLO\r\n").unwrap();
        assert_eq!(read_from_obj(&mut objs, src), Verdict::Ok);

        for id in [c1, c2] {
            assert_eq!(objs.get(id).unwrap().outbuf.len(), 7);
            assert_eq!(write_to_obj(&mut objs, id), Verdict::Ok);
        }
        let mut buf = [0u8; 16];
        let n = peer1.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"HELLO\r\n");
        let n = peer2.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"HELLO\r\n");
    }

    #[test]
    fn telnet_negotiation_is_stripped_and_answered() {
        let mut objs = ObjSet::new();
        let (src, mut dev) = console(&mut objs, "c1");
        let (sink, _peer) = client(&mut objs, "m1", AccessMode::Monitor, src);
        objs.subscribe(src, sink);

        dev.write_all(&[b'a', IAC, DO, 1, b'b']).unwrap();
        read_from_obj(&mut objs, src);

        // The data stream reaches the peer clean.
        assert_eq!(objs.get(sink).unwrap().outbuf.len(), 2);
        // The refusal sits in the console's own output buffer.
        assert_eq!(objs.get(src).unwrap().outbuf.len(), 3);
        write_to_obj(&mut objs, src);
        let mut buf = [0u8; 8];
        let n = dev.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[IAC, crate::telnet::WONT, 1]);
    }

    #[test]
    fn client_keystrokes_reach_the_console_when_writable() {
        let mut objs = ObjSet::new();
        let (con, mut dev) = console(&mut objs, "c1");
        let (cl, mut peer) = client(&mut objs, "u1", AccessMode::Attach, con);
        objs.subscribe(con, cl);
        objs.subscribe(cl, con);

        peer.write_all(b"ls\r").unwrap();
        read_from_obj(&mut objs, cl);
        assert_eq!(objs.get(con).unwrap().outbuf.len(), 3);
        write_to_obj(&mut objs, con);
        let mut buf = [0u8; 8];
        let n = dev.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ls\r");
    }

    #[test]
    fn monitor_clients_cannot_write() {
        let mut objs = ObjSet::new();
        let (con, _dev) = console(&mut objs, "c1");
        let (cl, mut peer) = client(&mut objs, "u1", AccessMode::Monitor, con);
        objs.subscribe(con, cl);

        peer.write_all(b"rm -rf\r").unwrap();
        read_from_obj(&mut objs, cl);
        assert!(objs.get(con).unwrap().outbuf.is_empty());
    }

    #[test]
    fn suspend_toggle_and_reset_flags() {
        let mut objs = ObjSet::new();
        let (con, _dev) = console(&mut objs, "c1");
        let (cl, mut peer) = client(&mut objs, "u1", AccessMode::Attach, con);
        objs.subscribe(con, cl);
        objs.subscribe(cl, con);

        peer.write_all(b"&Z&R").unwrap();
        read_from_obj(&mut objs, cl);
        assert!(objs.get(cl).unwrap().is_suspended_client());
        assert!(objs.get(con).unwrap().got_reset);
    }

    #[test]
    fn quit_escape_disposes_the_client() {
        let mut objs = ObjSet::new();
        let (con, _dev) = console(&mut objs, "c1");
        let (cl, mut peer) = client(&mut objs, "u1", AccessMode::Attach, con);
        objs.subscribe(con, cl);

        peer.write_all(b"&.").unwrap();
        assert_eq!(read_from_obj(&mut objs, cl), Verdict::Dispose);
    }

    #[test]
    fn eof_drains_before_disposal() {
        let mut objs = ObjSet::new();
        let (con, _dev) = console(&mut objs, "c1");
        let (cl, peer) = client(&mut objs, "u1", AccessMode::Monitor, con);
        objs.subscribe(con, cl);

        objs.get_mut(cl).unwrap().outbuf.enqueue(b"tail");
        // Half-close: the client went away but its buffer still holds data.
        peer.shutdown(std::net::Shutdown::Write).unwrap();
        assert_eq!(read_from_obj(&mut objs, cl), Verdict::Ok);
        assert!(objs.get(cl).unwrap().got_eof);
        // Once the drain completes the write path asks for disposal.
        assert_eq!(write_to_obj(&mut objs, cl), Verdict::Dispose);
    }

    #[test]
    fn telnet_eof_asks_for_reconnect() {
        let mut objs = ObjSet::new();
        let (con, dev) = console(&mut objs, "c1");
        drop(dev);
        assert_eq!(read_from_obj(&mut objs, con), Verdict::Reconnect);
    }

    #[test]
    fn hard_write_error_disposes_non_telnet() {
        let mut objs = ObjSet::new();
        let (con, _dev) = console(&mut objs, "c1");
        let (cl, peer) = client(&mut objs, "u1", AccessMode::Monitor, con);
        drop(peer);
        objs.get_mut(cl).unwrap().outbuf.enqueue(b"data");
        // The Rust test harness ignores SIGPIPE, so this surfaces as EPIPE.
        let verdict = write_to_obj(&mut objs, cl);
        assert_eq!(verdict, Verdict::Dispose);
    }

    #[test]
    fn would_block_is_silent() {
        let mut objs = ObjSet::new();
        let (con, _dev) = console(&mut objs, "c1");
        assert_eq!(read_from_obj(&mut objs, con), Verdict::Ok);
    }
}
