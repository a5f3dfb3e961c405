//! SIGHUP reconfig: every logfile is reopened at its (re-expanded) path, so
//! rotating a file out from under the daemon starts a fresh one; bytes that
//! follow land in the new file only.

mod common;

use std::io::Write;
use std::time::Duration;

use common::*;

#[test]
fn sighup_reopens_rotated_logfiles() {
    let device = FakeDevice::bind();
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("c1.log");
    let rotated = dir.path().join("c1.log.old");

    // Real handlers: this daemon's reconfig is driven by an actual SIGHUP.
    let sig_fd = conmuxd::signals::install().unwrap();
    let daemon = start_daemon_with(
        &format!(
            r#"
            [server]
            port = 0
            loopback = true

            [[console]]
            name = "c1"
            dev = "127.0.0.1:{}"
            log = "{}"
            "#,
            device.port,
            log.display()
        ),
        sig_fd,
    );
    let mut dev = device.accept_within(Duration::from_secs(5));

    dev.write_all(b"one\n").unwrap();
    wait_for_file(&log, Duration::from_secs(5), |s| s.contains("one"));

    std::fs::rename(&log, &rotated).unwrap();
    unsafe {
        libc::raise(libc::SIGHUP);
    }
    // The reopen happens at the top of the next tick.
    std::thread::sleep(Duration::from_millis(500));

    dev.write_all(b"two\n").unwrap();
    wait_for_file(&log, Duration::from_secs(5), |s| s.contains("two"));

    let old = std::fs::read_to_string(&rotated).unwrap();
    assert!(old.contains("one"));
    assert!(!old.contains("two"), "rotated file kept receiving bytes");
    let new = std::fs::read_to_string(&log).unwrap();
    assert!(!new.contains("one"));

    daemon.stop();
}
