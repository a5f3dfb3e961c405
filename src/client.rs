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

//! Client connections: the per-client state carried on the object, the
//! in-band `&` escape machine, and the greeting handshake performed by a
//! worker thread before the socket is promoted into the multiplexor loop.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::IntoRawFd;
use std::time::Duration;

use crate::control::{Controller, Ctl};
use crate::object::{Object, ObjId, ObjKind};

/// In-band command prefix typed by interactive clients.
pub const ESC_CHAR: u8 = b'&';

/// Longest request line the handshake accepts.
const MAX_REQUEST: usize = 256;

/// Access a client holds on its console once wired in.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum AccessMode {
    /// Read-only view of the console stream.
    #[display("monitor")]
    Monitor,
    /// Read-write with the cooperative write lock held.
    #[display("attach")]
    Attach,
    /// Read-write sharing the write lock with other joiners.
    #[display("join")]
    Join,
}

/// Access requested on the wire; `force` steals the write lock.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RequestedMode {
    Monitor,
    Attach,
    Force,
    Join,
}

/// Client state carried in the object's kind-specific slot.
#[derive(Debug)]
pub struct Client {
    /// Remote identity, e.g. `203.0.113.7:40212`.
    pub ident: String,
    pub mode: AccessMode,
    /// The console this client is wired to; set by the loop at promotion.
    pub console: Option<ObjId>,
    /// Outbound flow paused by the `&Z` command.
    pub got_suspend: bool,
    pub esc: EscState,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum EscState {
    #[default]
    Normal,
    /// Seen the escape character, expecting the command byte.
    Escape,
}

/// Commands decoded out of a client's keystroke stream. The remaining
/// payload in `data` flows onward to the console.
#[derive(Debug, Default)]
pub struct EscActions {
    pub data: Vec<u8>,
    pub quit: bool,
    pub suspend_toggle: bool,
    pub reset: bool,
}

/// Feeds client input through the escape machine, splitting in-band
/// commands from payload bytes. Unknown escape sequences are dropped.
pub fn scan_escapes(state: &mut EscState, input: &[u8]) -> EscActions {
    let mut out = EscActions::default();
    for &byte in input {
        *state = match *state {
            EscState::Normal => {
                if byte == ESC_CHAR {
                    EscState::Escape
                } else {
                    out.data.push(byte);
                    EscState::Normal
                }
            }
            EscState::Escape => {
                match byte {
                    ESC_CHAR => out.data.push(ESC_CHAR),
                    b'.' => out.quit = true,
                    b'Z' | b'z' => out.suspend_toggle = !out.suspend_toggle,
                    b'R' | b'r' => out.reset = true,
                    _ => {}
                }
                EscState::Normal
            }
        };
    }
    out
}

/// Greeting handshake, run on a worker thread for each accepted socket.
///
/// The worker reads a single request line, constructs the client object with
/// the greeting banner preloaded into its output buffer, and hands it to the
/// multiplexor loop through the controller. All peer wiring, write-lock
/// arbitration and the final `OK`/`ERR` reply happen on the loop thread; the
/// worker never touches another object's buffers.
pub fn process_client(mut sock: TcpStream, bufsize: usize, controller: &Controller) {
    let ident = match sock.peer_addr() {
        Ok(addr) => addr.to_string(),
        Err(_) => "<unknown>".to_owned(),
    };
    if sock
        .set_read_timeout(Some(Duration::from_secs(10)))
        .is_err()
    {
        return;
    }

    let line = match read_request_line(&mut sock) {
        Ok(line) => line,
        Err(err) => {
            log::info!("Dropping client <{ident}>: {err}");
            return;
        }
    };
    let (console, mode) = match parse_request(&line) {
        Some(req) => req,
        None => {
            log::info!("Dropping client <{ident}>: invalid request");
            let _ = sock.write_all(b"ERR invalid request\r\n");
            return;
        }
    };

    if sock.set_nonblocking(true).is_err() {
        return;
    }
    let fd = sock.into_raw_fd();
    let mut obj = Object::new(
        ident.clone(),
        fd,
        ObjKind::Client(Client {
            ident: ident.clone(),
            mode: AccessMode::Monitor,
            console: None,
            got_suspend: false,
            esc: EscState::Normal,
        }),
        bufsize,
    );
    obj.outbuf
        .enqueue(format!("conmuxd {}\r\n", env!("CARGO_PKG_VERSION")).as_bytes());

    log::debug!("Client <{ident}> requests console [{console}]");
    if controller
        .send(Ctl::NewClient { obj, console, mode })
        .is_err()
    {
        log::warn!("Dropping client <{ident}>: multiplexor is gone");
    }
}

/// Reads one `\n`-terminated line byte by byte, so nothing typed after the
/// newline is consumed before the socket joins the loop.
fn read_request_line(sock: &mut TcpStream) -> std::io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = sock.read(&mut byte)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        match byte[0] {
            b'\n' => break,
            b'\r' => {}
            b => line.push(b),
        }
        if line.len() > MAX_REQUEST {
            return Err(std::io::ErrorKind::InvalidData.into());
        }
    }
    String::from_utf8(line).map_err(|_| std::io::ErrorKind::InvalidData.into())
}

fn parse_request(line: &str) -> Option<(String, RequestedMode)> {
    let mut words = line.split_ascii_whitespace();
    if !words.next()?.eq_ignore_ascii_case("console") {
        return None;
    }
    let name = words.next()?.to_owned();
    let mode = match words.next() {
        None => RequestedMode::Monitor,
        Some(w) if w.eq_ignore_ascii_case("monitor") => RequestedMode::Monitor,
        Some(w) if w.eq_ignore_ascii_case("attach") => RequestedMode::Attach,
        Some(w) if w.eq_ignore_ascii_case("force") => RequestedMode::Force,
        Some(w) if w.eq_ignore_ascii_case("join") => RequestedMode::Join,
        Some(_) => return None,
    };
    if words.next().is_some() {
        return None;
    }
    Some((name, mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_bytes_pass_through() {
        let mut st = EscState::Normal;
        let out = scan_escapes(&mut st, b"hello");
        assert_eq!(out.data, b"hello");
        assert!(!out.quit && !out.suspend_toggle && !out.reset);
    }

    #[test]
    fn doubled_escape_is_literal() {
        let mut st = EscState::Normal;
        let out = scan_escapes(&mut st, b"a&&b");
        assert_eq!(out.data, b"a&b");
    }

    #[test]
    fn commands_are_stripped_from_payload() {
        let mut st = EscState::Normal;
        let out = scan_escapes(&mut st, b"ab&Zcd&.ef");
        assert_eq!(out.data, b"abcdef");
        assert!(out.suspend_toggle);
        assert!(out.quit);
    }

    #[test]
    fn double_toggle_cancels_out() {
        let mut st = EscState::Normal;
        let out = scan_escapes(&mut st, b"&Z&z");
        assert!(!out.suspend_toggle);
    }

    #[test]
    fn escape_state_spans_chunks() {
        let mut st = EscState::Normal;
        let out = scan_escapes(&mut st, b"x&");
        assert_eq!(out.data, b"x");
        assert_eq!(st, EscState::Escape);
        let out = scan_escapes(&mut st, b"R");
        assert!(out.reset);
        assert_eq!(st, EscState::Normal);
    }

    #[test]
    fn unknown_sequences_are_dropped() {
        let mut st = EscState::Normal;
        let out = scan_escapes(&mut st, b"a&qb");
        assert_eq!(out.data, b"ab");
    }

    #[test]
    fn parses_requests() {
        assert!(matches!(
            parse_request("console web1 attach"),
            Some((name, RequestedMode::Attach)) if name == "web1"
        ));
        assert!(matches!(
            parse_request("CONSOLE db FORCE"),
            Some((name, RequestedMode::Force)) if name == "db"
        ));
        assert!(matches!(
            parse_request("console db"),
            Some((_, RequestedMode::Monitor))
        ));
        assert_eq!(parse_request("monitor db").map(|r| r.0), None);
        assert_eq!(parse_request("console db attach extra").map(|r| r.0), None);
        assert_eq!(parse_request("console").map(|r| r.0), None);
    }
}
