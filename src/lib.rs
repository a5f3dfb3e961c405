//! Console-management daemon concentrating access to serial- and
//! network-attached device consoles behind a single TCP endpoint.
//!
//! The heart is a single-threaded multiplexor ([`mux::Mux`]): every endpoint
//! (the listening socket, clients, serial devices, telnet consoles,
//! logfiles and reset subprocesses) is a buffered [`object::Object`] driven
//! through a unified readiness-and-timer service ([`tpoll::Tpoll`]). Bytes
//! read from a source fan out into the output rings of its subscribed peers
//! and drain back to their descriptors as they become writable. Handshake
//! workers, the signal handlers and the reconnect/watchdog timers all feed
//! the same poll wait.

#[macro_use]
extern crate amplify;

pub mod client;
pub mod config;
pub mod control;
pub mod daemon;
pub mod engine;
pub mod logfile;
pub mod logging;
pub mod mux;
pub mod object;
pub mod ring;
pub mod serial;
pub mod signals;
pub mod telnet;
pub mod timestr;
pub mod tpoll;

pub use config::Config;
pub use control::{Controller, TimerEvent};
pub use engine::Verdict;
pub use mux::{Mux, StartError};
pub use object::{ObjId, ObjKind, ObjSet, Object};
pub use ring::RingBuf;
pub use tpoll::{Events, TimerId, Tpoll};
