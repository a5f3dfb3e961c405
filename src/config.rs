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

//! The server configuration record: daemon options plus one declaration per
//! console, loaded from a TOML file and validated before any object is
//! built.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::serial::{LineError, LineSettings};

pub const DEFAULT_PORT: u16 = 7890;
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_RESET_TIMEOUT: u64 = 60;

#[derive(Debug, Display, Error)]
#[display(doc_comments)]
pub enum ConfigError {
    /// unable to read configuration "{0:?}": {1}
    Read(PathBuf, io::Error),

    /// configuration "{0:?}" is malformed: {1}
    Toml(PathBuf, toml::de::Error),

    /// configuration has no consoles defined
    NoConsoles,

    /// duplicate console name "{0}"
    DuplicateName(String),

    /// console "{0}": device "{1}" is neither a device path nor host:port
    BadDevice(String, String),

    /// console "{0}": {1}
    BadLine(String, LineError),

    /// invalid log level "{0}"
    BadLevel(String),

    /// daemon logfile "{0:?}" must be an absolute path
    RelativeLogfile(PathBuf),

    /// buffer size must be positive
    BadBufferSize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerOptions,
    #[serde(default, rename = "console")]
    pub consoles: Vec<ConsoleDecl>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerOptions {
    /// TCP port clients connect to.
    pub port: u16,
    /// Bind the loopback interface only.
    pub loopback: bool,
    /// Enable SO_KEEPALIVE on accepted client sockets.
    pub keepalive: bool,
    /// Consult the host-based access filter before admitting a client.
    pub tcp_wrap: bool,
    /// Truncate every logfile once at daemon start.
    pub zero_logs: bool,
    /// Print a configuration summary to stderr at startup.
    pub verbose: bool,
    /// Daemon logfile; absolute path, `%D` expands to the local date.
    pub logfile: Option<PathBuf>,
    /// Level written to the daemon logfile: error, warn, info or debug.
    pub log_level: String,
    /// Accepted for compatibility; the sink currently writes files only.
    pub syslog_facility: Option<String>,
    /// Shell template run to power-cycle a console; `%N` expands to the
    /// console name.
    pub reset_cmd: Option<String>,
    /// Seconds before a running reset command's process group is SIGKILLed.
    pub reset_timeout_secs: u64,
    /// Write a timestamp line into every logfile each interval; 0 disables.
    pub timestamp_minutes: u32,
    /// Ring buffer size per object.
    pub buffer_size: usize,
    /// Have a SIGHUP reconfig also reopen downed serial consoles and reset
    /// telnet back-off, instead of only reopening logfiles.
    pub revive_on_reconfig: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            loopback: false,
            keepalive: true,
            tcp_wrap: false,
            zero_logs: false,
            verbose: false,
            logfile: None,
            log_level: "info".to_owned(),
            syslog_facility: None,
            reset_cmd: None,
            reset_timeout_secs: DEFAULT_RESET_TIMEOUT,
            timestamp_minutes: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            revive_on_reconfig: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsoleDecl {
    pub name: String,
    /// `/dev/...` path for a serial console, `host:port` for telnet.
    pub dev: String,
    /// Serial line settings, e.g. `115200,8n1`; ignored for telnet.
    #[serde(default)]
    pub seropts: Option<String>,
    /// Logfile template; `%N` is the console name, `%D` the local date.
    #[serde(default)]
    pub log: Option<String>,
}

/// What a console's `dev` string resolves to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DeviceSpec {
    Serial(PathBuf),
    Telnet { host: String, port: u16 },
}

impl ConsoleDecl {
    pub fn device(&self) -> Result<DeviceSpec, ConfigError> {
        if self.dev.starts_with('/') {
            return Ok(DeviceSpec::Serial(PathBuf::from(&self.dev)));
        }
        if let Some((host, port)) = self.dev.rsplit_once(':') {
            if !host.is_empty() {
                if let Ok(port) = port.parse::<u16>() {
                    return Ok(DeviceSpec::Telnet {
                        host: host.to_owned(),
                        port,
                    });
                }
            }
        }
        Err(ConfigError::BadDevice(self.name.clone(), self.dev.clone()))
    }

    pub fn line_settings(&self) -> Result<LineSettings, ConfigError> {
        match &self.seropts {
            None => Ok(LineSettings::default()),
            Some(opts) => opts
                .parse()
                .map_err(|err| ConfigError::BadLine(self.name.clone(), err)),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text =
            fs::read_to_string(path).map_err(|err| ConfigError::Read(path.to_owned(), err))?;
        let config: Config =
            toml::from_str(&text).map_err(|err| ConfigError::Toml(path.to_owned(), err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consoles.is_empty() {
            return Err(ConfigError::NoConsoles);
        }
        // Ring buffers reject a zero capacity; catch it before any object
        // is built.
        if self.server.buffer_size == 0 {
            return Err(ConfigError::BadBufferSize);
        }
        let mut names = HashSet::new();
        for console in &self.consoles {
            if !names.insert(console.name.as_str()) {
                return Err(ConfigError::DuplicateName(console.name.clone()));
            }
            console.device()?;
            console.line_settings()?;
        }
        if let Some(logfile) = &self.server.logfile {
            if !logfile.is_absolute() {
                return Err(ConfigError::RelativeLogfile(logfile.clone()));
            }
        }
        self.server.level_filter()?;
        Ok(())
    }
}

impl ServerOptions {
    pub fn level_filter(&self) -> Result<log::LevelFilter, ConfigError> {
        Ok(match self.log_level.to_ascii_lowercase().as_str() {
            "error" => log::LevelFilter::Error,
            "warn" | "warning" => log::LevelFilter::Warn,
            "info" | "notice" => log::LevelFilter::Info,
            "debug" => log::LevelFilter::Debug,
            _ => return Err(ConfigError::BadLevel(self.log_level.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn load_str(text: &str) -> Result<Config, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        Config::load(file.path())
    }

    #[test]
    fn loads_a_full_configuration() {
        let config = load_str(
            r#"
            [server]
            port = 7999
            loopback = true
            logfile = "/var/log/conmuxd.log"
            log_level = "debug"
            reset_cmd = "powerman -c %N"
            timestamp_minutes = 15

            [[console]]
            name = "web1"
            dev = "/dev/ttyS0"
            seropts = "115200,8n1"
            log = "/var/log/consoles/%N.log"

            [[console]]
            name = "db"
            dev = "annex1:7001"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 7999);
        assert!(config.server.loopback);
        assert_eq!(config.consoles.len(), 2);
        assert_eq!(
            config.consoles[0].device().unwrap(),
            DeviceSpec::Serial(PathBuf::from("/dev/ttyS0"))
        );
        assert_eq!(
            config.consoles[1].device().unwrap(),
            DeviceSpec::Telnet {
                host: "annex1".into(),
                port: 7001
            }
        );
    }

    #[test]
    fn defaults_apply_without_a_server_table() {
        let config = load_str(
            r#"
            [[console]]
            name = "c1"
            dev = "127.0.0.1:6001"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.server.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.server.keepalive);
    }

    #[test]
    fn no_consoles_is_fatal() {
        assert!(matches!(load_str("[server]\n"), Err(ConfigError::NoConsoles)));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = load_str(
            r#"
            [[console]]
            name = "c1"
            dev = "a:1"
            [[console]]
            name = "c1"
            dev = "b:2"
            "#,
        );
        assert!(matches!(err, Err(ConfigError::DuplicateName(n)) if n == "c1"));
    }

    #[test]
    fn bad_devices_are_rejected() {
        for dev in ["ttyS0", "host:", ":70", "host:badport"] {
            let err = load_str(&format!(
                "[[console]]\nname = \"c\"\ndev = \"{dev}\"\n"
            ));
            assert!(matches!(err, Err(ConfigError::BadDevice(_, _))), "{dev}");
        }
    }

    #[test]
    fn relative_daemon_logfile_is_rejected() {
        let err = load_str(
            r#"
            [server]
            logfile = "conmuxd.log"
            [[console]]
            name = "c1"
            dev = "a:1"
            "#,
        );
        assert!(matches!(err, Err(ConfigError::RelativeLogfile(_))));
    }

    #[test]
    fn zero_buffer_size_is_rejected() {
        let err = load_str(
            r#"
            [server]
            buffer_size = 0
            [[console]]
            name = "c1"
            dev = "a:1"
            "#,
        );
        assert!(matches!(err, Err(ConfigError::BadBufferSize)));
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let err = load_str(
            r#"
            [server]
            log_level = "loud"
            [[console]]
            name = "c1"
            dev = "a:1"
            "#,
        );
        assert!(matches!(err, Err(ConfigError::BadLevel(_))));
    }
}
