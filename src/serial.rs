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

//! Serial console devices: opening with the configured line settings and
//! restoring the saved termios state on close.

use std::ffi::CString;
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum Parity {
    #[display("n")]
    None,
    #[display("e")]
    Even,
    #[display("o")]
    Odd,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum Flow {
    #[display("none")]
    None,
    #[display("xonxoff")]
    XonXoff,
    #[display("rtscts")]
    RtsCts,
}

/// Serial line settings in the classic `baud,<data><parity><stop>[,flow]`
/// notation, e.g. `115200,8n1` or `9600,7e1,xonxoff`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct LineSettings {
    pub baud: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub flow: Flow,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow: Flow::None,
        }
    }
}

impl fmt::Display for LineSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{}{}{},{}",
            self.baud, self.data_bits, self.parity, self.stop_bits, self.flow
        )
    }
}

#[derive(Debug, Display, Error)]
#[display(doc_comments)]
pub enum LineError {
    /// invalid serial line settings "{0}"
    Syntax(String),
    /// unsupported baud rate {0}
    Baud(u32),
}

impl FromStr for LineSettings {
    type Err = LineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || LineError::Syntax(s.to_owned());
        let mut settings = LineSettings::default();
        let mut parts = s.split(',');

        let baud = parts.next().ok_or_else(bad)?.trim();
        settings.baud = baud.parse().map_err(|_| bad())?;
        baud_flag(settings.baud).ok_or(LineError::Baud(settings.baud))?;

        if let Some(frame) = parts.next() {
            let frame = frame.trim().as_bytes();
            if frame.len() != 3 {
                return Err(bad());
            }
            settings.data_bits = match frame[0] {
                b'5'..=b'8' => frame[0] - b'0',
                _ => return Err(bad()),
            };
            settings.parity = match frame[1].to_ascii_lowercase() {
                b'n' => Parity::None,
                b'e' => Parity::Even,
                b'o' => Parity::Odd,
                _ => return Err(bad()),
            };
            settings.stop_bits = match frame[2] {
                b'1' | b'2' => frame[2] - b'0',
                _ => return Err(bad()),
            };
        }
        if let Some(flow) = parts.next() {
            settings.flow = match flow.trim().to_ascii_lowercase().as_str() {
                "none" => Flow::None,
                "xonxoff" => Flow::XonXoff,
                "rtscts" => Flow::RtsCts,
                _ => return Err(bad()),
            };
        }
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(settings)
    }
}

#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum OpenError {
    /// "{0:?}" is not a terminal device
    NotATty(PathBuf),

    /// unsupported baud rate {0}
    Baud(u32),

    /// device path contains an interior NUL byte
    BadPath,

    /// {0}
    #[from]
    Io(io::Error),
}

/// Serial console state: device path, line settings and the termios saved at
/// open time for restoration on close.
pub struct Serial {
    pub path: PathBuf,
    pub settings: LineSettings,
    saved: Option<libc::termios>,
}

impl Debug for Serial {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serial")
            .field("path", &self.path)
            .field("settings", &self.settings)
            .field("saved", &self.saved.is_some())
            .finish()
    }
}

impl Serial {
    pub fn new(path: PathBuf, settings: LineSettings) -> Self {
        Self {
            path,
            settings,
            saved: None,
        }
    }

    /// Opens the device non-blocking and close-on-exec, saves the current
    /// termios and applies the configured line settings in raw mode.
    pub fn open(&mut self) -> Result<RawFd, OpenError> {
        let cpath = CString::new(self.path.as_os_str().as_bytes()).map_err(|_| OpenError::BadPath)?;
        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_NOCTTY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut tio = MaybeUninit::<libc::termios>::uninit();
        if unsafe { libc::tcgetattr(fd, tio.as_mut_ptr()) } < 0 {
            unsafe { libc::close(fd) };
            return Err(OpenError::NotATty(self.path.clone()));
        }
        let saved = unsafe { tio.assume_init() };

        let mut raw = saved;
        unsafe { libc::cfmakeraw(&mut raw) };
        if let Err(err) = apply_line_settings(&mut raw, &self.settings) {
            unsafe { libc::close(fd) };
            return Err(err);
        }
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err.into());
        }

        self.saved = Some(saved);
        log::info!(
            "Opened serial device \"{}\" ({})",
            self.path.display(),
            self.settings
        );
        Ok(fd)
    }

    /// Restores the termios saved at open time. Errors are ignored since the
    /// device may already be gone.
    pub fn restore(&mut self, fd: RawFd) {
        if let Some(saved) = self.saved.take() {
            unsafe {
                libc::tcsetattr(fd, libc::TCSANOW, &saved);
            }
        }
    }
}

fn apply_line_settings(tio: &mut libc::termios, settings: &LineSettings) -> Result<(), OpenError> {
    let speed = baud_flag(settings.baud).ok_or(OpenError::Baud(settings.baud))?;
    unsafe {
        libc::cfsetispeed(tio, speed);
        libc::cfsetospeed(tio, speed);
    }

    tio.c_cflag &= !(libc::CSIZE | libc::PARENB | libc::PARODD | libc::CSTOPB | libc::CRTSCTS);
    tio.c_cflag |= match settings.data_bits {
        5 => libc::CS5,
        6 => libc::CS6,
        7 => libc::CS7,
        _ => libc::CS8,
    };
    match settings.parity {
        Parity::None => {}
        Parity::Even => tio.c_cflag |= libc::PARENB,
        Parity::Odd => tio.c_cflag |= libc::PARENB | libc::PARODD,
    }
    if settings.stop_bits == 2 {
        tio.c_cflag |= libc::CSTOPB;
    }
    // Keep the receiver enabled and the line local after cfmakeraw.
    tio.c_cflag |= libc::CREAD | libc::CLOCAL;

    tio.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);
    match settings.flow {
        Flow::None => {}
        Flow::XonXoff => tio.c_iflag |= libc::IXON | libc::IXOFF,
        Flow::RtsCts => tio.c_cflag |= libc::CRTSCTS,
    }

    tio.c_cc[libc::VMIN] = 1;
    tio.c_cc[libc::VTIME] = 0;
    Ok(())
}

fn baud_flag(baud: u32) -> Option<libc::speed_t> {
    Some(match baud {
        300 => libc::B300,
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_settings() {
        let s: LineSettings = "115200,8n1,rtscts".parse().unwrap();
        assert_eq!(s.baud, 115200);
        assert_eq!(s.data_bits, 8);
        assert_eq!(s.parity, Parity::None);
        assert_eq!(s.stop_bits, 1);
        assert_eq!(s.flow, Flow::RtsCts);
    }

    #[test]
    fn parses_bare_baud() {
        let s: LineSettings = "9600".parse().unwrap();
        assert_eq!(s, LineSettings::default());
    }

    #[test]
    fn rejects_unknown_baud() {
        assert!(matches!(
            "12345".parse::<LineSettings>(),
            Err(LineError::Baud(12345))
        ));
    }

    #[test]
    fn rejects_malformed_frame() {
        assert!("9600,9n1".parse::<LineSettings>().is_err());
        assert!("9600,8x1".parse::<LineSettings>().is_err());
        assert!("9600,8n3".parse::<LineSettings>().is_err());
        assert!("9600,8n1,weird".parse::<LineSettings>().is_err());
    }

    #[test]
    fn opening_a_non_tty_fails() {
        let mut ser = Serial::new("/dev/null".into(), LineSettings::default());
        assert!(matches!(ser.open(), Err(OpenError::NotATty(_))));
    }
}
