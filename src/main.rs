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

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use conmuxd::mux::StartError;
use conmuxd::{config::Config, control, daemon, logging, mux::Mux, signals};

#[derive(Parser)]
#[command(name = "conmuxd", version, about = "Console management daemon")]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = "/etc/conmuxd.conf")]
    config: PathBuf,

    /// Stay in the foreground instead of daemonizing
    #[arg(short = 'F', long)]
    foreground: bool,

    /// Override the configured listen port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Override the configured daemon logfile (absolute path)
    #[arg(short = 'L', long)]
    logfile: Option<PathBuf>,

    /// Verbose logging plus a configuration summary on startup
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    logging::init(if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });

    let status_fd = if args.foreground {
        -1
    } else {
        match daemon::begin_daemonize() {
            Ok(fd) => fd,
            Err(err) => {
                log::error!("Unable to daemonize: {err}");
                exit(1);
            }
        }
    };

    match run(args, status_fd) {
        Ok(()) => exit(0),
        Err(err) => {
            log::error!("{err}");
            daemon::report_startup_failure(status_fd);
            exit(1);
        }
    }
}

fn run(args: Args, status_fd: RawFd) -> Result<(), StartError> {
    let sig_fd = signals::install()?;

    let mut config = Config::load(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(logfile) = args.logfile {
        config.server.logfile = Some(logfile);
    }
    if args.verbose {
        config.server.verbose = true;
    }
    config.validate()?;

    let mut mux = Mux::new(&config, sig_fd)?;
    if config.server.verbose {
        display_configuration(&config, &mux, &args.config);
    }

    let level = config.server.level_filter()?;
    match &config.server.logfile {
        Some(logfile) => {
            logging::open_daemon_log(
                &logfile.to_string_lossy(),
                level,
                config.server.zero_logs,
            )
            .map_err(StartError::DaemonLog)?;
        }
        None => log::set_max_level(level),
    }

    mux.open_objs()?;

    if !args.foreground {
        daemon::end_daemonize(status_fd)?;
    }

    log::info!(
        "Starting conmuxd {} (pid {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );

    control::init_global(mux.controller());
    let result = mux.run();
    control::teardown_global();

    log::info!(
        "Stopping conmuxd {} (pid {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );
    Ok(result?)
}

/// Startup summary printed to stderr with `--verbose`, before the terminal
/// is detached.
fn display_configuration(config: &Config, mux: &Mux, path: &std::path::Path) {
    let server = &config.server;
    let mut options = Vec::new();
    if server.keepalive {
        options.push("KeepAlive".to_owned());
    }
    if server.logfile.is_some() {
        options.push("LogFile".to_owned());
    }
    if server.loopback {
        options.push("LoopBack".to_owned());
    }
    if server.reset_cmd.is_some() {
        options.push("ResetCmd".to_owned());
    }
    if server.tcp_wrap {
        options.push("TCP-Wrappers".to_owned());
    }
    if server.timestamp_minutes > 0 {
        options.push(format!("TimeStamp={}m", server.timestamp_minutes));
    }
    if server.zero_logs {
        options.push("ZeroLogs".to_owned());
    }
    if server.revive_on_reconfig {
        options.push("ReviveOnReconfig".to_owned());
    }
    if options.is_empty() {
        options.push("None".to_owned());
    }

    let consoles = mux.console_count();
    eprintln!();
    eprintln!(
        "Starting conmuxd {} (pid {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );
    eprintln!("Configuration: {}", path.display());
    eprintln!("Options: {}", options.join(" "));
    eprintln!("Listening on port {}", mux.local_port());
    eprintln!(
        "Monitoring {} console{}",
        consoles,
        if consoles == 1 { "" } else { "s" }
    );
    eprintln!();
}
