//! The `&R` escape runs the configured reset command in its own process
//! group; the watchdog SIGKILLs the whole group when the command outlives
//! its limit, and the SIGCHLD reaper collects the corpses.

mod common;

use std::io::Write;
use std::time::{Duration, Instant};

use common::*;

#[test]
fn runaway_reset_command_is_killed_as_a_group() {
    let device = FakeDevice::bind();
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("reset.pid");

    // Real handlers so the SIGCHLD reaper collects the killed children.
    let sig_fd = conmuxd::signals::install().unwrap();
    let daemon = start_daemon_with(
        &format!(
            r#"
            [server]
            port = 0
            loopback = true
            reset_cmd = "echo $$ > {pid_file} && exec sleep 300"
            reset_timeout_secs = 1

            [[console]]
            name = "c1"
            dev = "127.0.0.1:{dev_port}"
            "#,
            pid_file = pid_file.display(),
            dev_port = device.port,
        ),
        sig_fd,
    );
    // The watchdog is armed through the global controller handle.
    conmuxd::control::init_global(daemon.controller.clone());

    let _dev = device.accept_within(Duration::from_secs(5));
    let (mut client, reply) = daemon.connect_console("c1", "attach");
    assert_eq!(reply, "OK attach c1");

    let fired = Instant::now();
    client.write_all(b"&R").unwrap();

    let pid: libc::pid_t = wait_for_file(&pid_file, Duration::from_secs(5), |s| {
        !s.trim().is_empty()
    })
    .trim()
    .parse()
    .unwrap();
    assert!(pid > 0);

    // Killed and reaped within the limit plus scheduling slack.
    let deadline = fired + Duration::from_millis(3500);
    loop {
        if unsafe { libc::kill(pid, 0) } < 0 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "reset command survived its watchdog"
        );
        std::thread::sleep(Duration::from_millis(100));
    }

    // No zombies left behind.
    std::thread::sleep(Duration::from_millis(200));
    let reaped = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
    assert!(reaped <= 0, "unreaped child {reaped} remained");

    daemon.stop();
    conmuxd::control::teardown_global();
}
