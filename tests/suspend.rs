//! The `&Z` escape pauses a client's outbound flow: its descriptor leaves
//! the writable set while console output accumulates in its ring, and a
//! resume delivers everything.

mod common;

use std::io::Write;
use std::time::Duration;

use common::*;

#[test]
fn suspend_holds_output_and_resume_delivers_it_all() {
    let device = FakeDevice::bind();
    let daemon = start_daemon(&format!(
        r#"
        [server]
        port = 0
        loopback = true

        [[console]]
        name = "c1"
        dev = "127.0.0.1:{}"
        "#,
        device.port
    ));
    let mut dev = device.accept_within(Duration::from_secs(5));

    let (mut client, reply) = daemon.connect_console("c1", "attach");
    assert_eq!(reply, "OK attach c1");

    // Sync point: the wiring works end to end.
    dev.write_all(b"ready\r\n").unwrap();
    assert_eq!(
        read_exact_within(&mut client, 7, Duration::from_secs(5)),
        b"ready\r\n"
    );

    client.write_all(b"&Z").unwrap();
    std::thread::sleep(Duration::from_millis(300));

    let payload = vec![b'A'; 10 * 1024];
    dev.write_all(&payload).unwrap();
    assert_silent_for(&mut client, Duration::from_millis(500));

    client.write_all(b"&z").unwrap();
    let received = read_exact_within(&mut client, payload.len(), Duration::from_secs(10));
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);

    daemon.stop();
}
