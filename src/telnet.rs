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

//! Network-attached consoles reached over telnet: the non-blocking connect
//! state machine with bounded exponential reconnect back-off, and the IAC
//! filter that strips option negotiation from the data stream.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::time::Duration;

use crate::object::Object;
use crate::tpoll::TimerId;

/// Reconnect back-off floor; every successful connect resets the delay here.
pub const RECONNECT_FLOOR: Duration = Duration::from_secs(1);
/// Reconnect back-off cap.
pub const RECONNECT_CAP: Duration = Duration::from_secs(60);

#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum ConState {
    /// No connection; fd is -1 and at most one reconnect timer is pending.
    #[display("down")]
    Down,
    /// Non-blocking connect in flight; polled for both read and write.
    #[display("pending")]
    Pending,
    /// Connection established; polled for read like any console.
    #[display("up")]
    Up,
}

/// Telnet console state.
#[derive(Debug)]
pub struct Telnet {
    pub host: String,
    pub port: u16,
    pub addr: SocketAddr,
    pub state: ConState,
    /// Outstanding reconnect timer, if any (invariant: at most one).
    pub timer: Option<TimerId>,
    pub iac: IacState,
    delay: Duration,
}

impl Telnet {
    pub fn new(host: String, port: u16, addr: SocketAddr) -> Self {
        Self {
            host,
            port,
            addr,
            state: ConState::Down,
            timer: None,
            iac: IacState::Data,
            delay: RECONNECT_FLOOR,
        }
    }

    /// The delay to use for the next reconnect attempt, advancing the
    /// bounded exponential schedule.
    pub fn fail_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (delay * 2).min(RECONNECT_CAP);
        delay
    }

    /// Resets the back-off schedule after a successful connect.
    fn note_up(&mut self) {
        self.delay = RECONNECT_FLOOR;
        self.iac = IacState::Data;
        self.state = ConState::Up;
    }

    /// Back-off peek without advancing, for reconfig-driven resets.
    pub fn reset_backoff(&mut self) { self.delay = RECONNECT_FLOOR; }
}

/// Result of starting or advancing a connect attempt.
#[derive(Debug)]
pub enum ConnectOutcome {
    Up,
    Pending,
    /// The attempt failed; retry after the given back-off delay.
    Failed(Duration),
}

/// Starts a non-blocking connect on a telnet object in state `Down`.
pub fn connect(obj: &mut Object) -> ConnectOutcome {
    debug_assert!(obj.fd < 0);
    let name = obj.name.clone();
    let tel = obj.telnet_mut().expect("connect on a non-telnet object");
    debug_assert_eq!(tel.state, ConState::Down);

    let (addr, len) = sockaddr_of(&tel.addr);
    let family = match tel.addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        log::warn!("Unable to create socket for console [{}]: {err}", name);
        return ConnectOutcome::Failed(tel.fail_delay());
    }

    let rc = unsafe { libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len) };
    if rc == 0 {
        obj.fd = fd;
        let tel = obj.telnet_mut().expect("kind checked above");
        tel.note_up();
        log::info!("Console [{}] connected to <{}:{}>", name, tel.host, tel.port);
        return ConnectOutcome::Up;
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EINTR) => {
            obj.fd = fd;
            let tel = obj.telnet_mut().expect("kind checked above");
            tel.state = ConState::Pending;
            ConnectOutcome::Pending
        }
        _ => {
            unsafe { libc::close(fd) };
            let tel = obj.telnet_mut().expect("kind checked above");
            tel.state = ConState::Down;
            let delay = tel.fail_delay();
            log::info!(
                "Unable to connect console [{}] to <{}:{}>: {err}; retrying in {}s",
                name,
                tel.host,
                tel.port,
                delay.as_secs()
            );
            ConnectOutcome::Failed(delay)
        }
    }
}

/// Advances a `Pending` connect whose fd signalled readiness: inspects the
/// socket error and transitions to `Up` or back to `Down`.
pub fn advance(obj: &mut Object) -> ConnectOutcome {
    debug_assert!(obj.fd >= 0);
    let name = obj.name.clone();
    let fd = obj.fd;
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == 0 && err == 0 {
        let tel = obj.telnet_mut().expect("advance on a non-telnet object");
        tel.note_up();
        log::info!("Console [{}] connected to <{}:{}>", name, tel.host, tel.port);
        return ConnectOutcome::Up;
    }

    let cause = if rc == 0 {
        io::Error::from_raw_os_error(err)
    } else {
        io::Error::last_os_error()
    };
    unsafe { libc::close(fd) };
    obj.fd = -1;
    let tel = obj.telnet_mut().expect("advance on a non-telnet object");
    tel.state = ConState::Down;
    let delay = tel.fail_delay();
    log::info!(
        "Unable to connect console [{}] to <{}:{}>: {cause}; retrying in {}s",
        name,
        tel.host,
        tel.port,
        delay.as_secs()
    );
    ConnectOutcome::Failed(delay)
}

/// Tears an `Up` or `Pending` connection down after a read/write failure or
/// peer close. Buffers are discarded; the object is retained for reconnect.
pub fn drop_connection(obj: &mut Object) -> Duration {
    if obj.fd >= 0 {
        unsafe { libc::close(obj.fd) };
        obj.fd = -1;
    }
    obj.got_eof = false;
    while !obj.inbuf.is_empty() {
        let n = obj.inbuf.view().len();
        obj.inbuf.advance(n);
    }
    while !obj.outbuf.is_empty() {
        let n = obj.outbuf.view().len();
        obj.outbuf.advance(n);
    }
    let tel = obj.telnet_mut().expect("reconnect on a non-telnet object");
    tel.state = ConState::Down;
    tel.iac = IacState::Data;
    tel.fail_delay()
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin;
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6;
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

/// Parse state of the telnet in-band command stream.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum IacState {
    #[default]
    Data,
    /// Seen IAC, expecting a command byte.
    Cmd,
    /// Seen IAC WILL/WONT/DO/DONT, expecting the option byte.
    Opt(u8),
    /// Inside a subnegotiation block, skipping until IAC SE.
    Sub,
    /// Seen IAC inside a subnegotiation block.
    SubIac,
}

/// Filters a raw chunk received from a telnet peer: data bytes are appended
/// to `data`, refusals for every offered or requested option to `reply`
/// (which belongs in the telnet object's own output buffer).
pub fn filter_iac(state: &mut IacState, input: &[u8], data: &mut Vec<u8>, reply: &mut Vec<u8>) {
    for &byte in input {
        *state = match *state {
            IacState::Data => {
                if byte == IAC {
                    IacState::Cmd
                } else {
                    data.push(byte);
                    IacState::Data
                }
            }
            IacState::Cmd => match byte {
                IAC => {
                    // Escaped 0xFF data byte.
                    data.push(IAC);
                    IacState::Data
                }
                WILL | WONT | DO | DONT => IacState::Opt(byte),
                SB => IacState::Sub,
                _ => IacState::Data,
            },
            IacState::Opt(cmd) => {
                match cmd {
                    WILL => reply.extend_from_slice(&[IAC, DONT, byte]),
                    DO => reply.extend_from_slice(&[IAC, WONT, byte]),
                    _ => {}
                }
                IacState::Data
            }
            IacState::Sub => {
                if byte == IAC {
                    IacState::SubIac
                } else {
                    IacState::Sub
                }
            }
            IacState::SubIac => match byte {
                SE => IacState::Data,
                _ => IacState::Sub,
            },
        };
    }
}
