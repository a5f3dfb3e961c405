//! Shared scaffolding for the scenario tests: a daemon running in a
//! background thread against an ephemeral port, fake console devices, and
//! line-oriented client helpers.
#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::RawFd;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use conmuxd::{Config, Controller, Mux};

/// A plain pipe standing in for the signal self-pipe in tests that do not
/// exercise real signals. The write end is intentionally leaked.
pub fn fake_signal_pipe() -> RawFd {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(rc, 0);
    fds[0]
}

pub struct TestDaemon {
    pub port: u16,
    pub controller: Controller,
    handle: JoinHandle<std::io::Result<()>>,
}

/// Parses the TOML, builds and opens the multiplexor and runs it on a
/// background thread. The configuration should use `port = 0`.
pub fn start_daemon_with(config_toml: &str, sig_fd: RawFd) -> TestDaemon {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(config_toml.as_bytes()).unwrap();
    let config = Config::load(file.path()).unwrap();

    let mut mux = Mux::new(&config, sig_fd).unwrap();
    mux.open_objs().unwrap();
    let port = mux.local_port();
    let controller = mux.controller();
    let handle = std::thread::spawn(move || mux.run());
    TestDaemon {
        port,
        controller,
        handle,
    }
}

pub fn start_daemon(config_toml: &str) -> TestDaemon {
    start_daemon_with(config_toml, fake_signal_pipe())
}

impl TestDaemon {
    /// Connects and performs the greeting handshake; returns the socket and
    /// the server's reply line (`OK ...` or `ERR ...`).
    pub fn connect_console(&self, name: &str, mode: &str) -> (TcpStream, String) {
        let mut sock = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        sock.set_nodelay(true).unwrap();
        sock.write_all(format!("console {name} {mode}\n").as_bytes())
            .unwrap();
        let banner = read_line(&mut sock);
        assert!(banner.starts_with("conmuxd "), "unexpected banner: {banner}");
        let reply = read_line(&mut sock);
        (sock, reply)
    }

    pub fn stop(self) {
        self.controller.shutdown().unwrap();
        self.handle.join().unwrap().unwrap();
    }
}

/// Reads one CRLF- or LF-terminated line.
pub fn read_line(sock: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match sock.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => match byte[0] {
                b'\n' => break,
                b'\r' => {}
                b => line.push(b),
            },
            Err(err) => panic!("reading line: {err}"),
        }
    }
    String::from_utf8(line).unwrap()
}

/// Reads until `want` bytes arrived or the deadline passes.
pub fn read_exact_within(sock: &mut TcpStream, want: usize, limit: Duration) -> Vec<u8> {
    let deadline = Instant::now() + limit;
    let mut out = Vec::with_capacity(want);
    let mut buf = [0u8; 4096];
    sock.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    while out.len() < want && Instant::now() < deadline {
        match sock.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
            Err(err) => panic!("reading stream: {err}"),
        }
    }
    out
}

/// Asserts that nothing arrives on the socket within the window.
pub fn assert_silent_for(sock: &mut TcpStream, window: Duration) {
    sock.set_read_timeout(Some(window)).unwrap();
    let mut buf = [0u8; 64];
    match sock.read(&mut buf) {
        Ok(n) => panic!("expected silence, read {n} bytes"),
        Err(err) => assert!(
            err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut,
            "expected timeout, got: {err}"
        ),
    }
}

/// A console device the daemon's telnet connector dials into.
pub struct FakeDevice {
    listener: TcpListener,
    pub port: u16,
}

impl FakeDevice {
    pub fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        FakeDevice { listener, port }
    }

    /// Waits for the daemon's connect, up to the limit.
    pub fn accept_within(&self, limit: Duration) -> TcpStream {
        self.listener.set_nonblocking(true).unwrap();
        let deadline = Instant::now() + limit;
        loop {
            match self.listener.accept() {
                Ok((sock, _)) => {
                    sock.set_nonblocking(false).unwrap();
                    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                    return sock;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "daemon never connected");
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(err) => panic!("accepting device connection: {err}"),
            }
        }
    }
}

/// Polls a file until its contents satisfy the predicate or the limit
/// passes; returns the final contents.
pub fn wait_for_file(path: &std::path::Path, limit: Duration, pred: impl Fn(&str) -> bool) -> String {
    let deadline = Instant::now() + limit;
    loop {
        let content = std::fs::read_to_string(path).unwrap_or_default();
        if pred(&content) {
            return content;
        }
        assert!(
            Instant::now() < deadline,
            "file {} never matched; last contents: {content:?}",
            path.display()
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}
