//! End-to-end exercise of the accept → routine → synchronous I/O path
//! against a real TCP socket pair. `Runtime` is not `Send` (it carries raw
//! `Cell<*mut _>` pointers and a handler with no `Send` bound), matching
//! this crate's single-thread-per-process contract, so each test runs its
//! `Runtime` on the test's own thread and only hands a plain `TcpStream` off
//! to a background thread for the client side. `CURRENT_RUNTIME` is also a
//! single process-wide slot, so every test in this file takes a shared lock
//! first to keep them from racing each other under `cargo test`'s default
//! parallel test execution.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;
use std::thread;

use ef_runtime::{io, Runtime, RuntimeConfig};

static GUARD: Mutex<()> = Mutex::new(());

#[test]
fn echo_connection_roundtrip() {
    let _lock = GUARD.lock().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let listen_fd = listener.as_raw_fd();
    std::mem::forget(listener); // the runtime now owns this fd's lifecycle

    let mut runtime = Runtime::new(RuntimeConfig::default()).unwrap();
    runtime
        .add_listener(listen_fd, |fd, routine| {
            let mut buf = [0u8; 64];
            if let Ok(n) = io::read(fd, &mut buf) {
                if n > 0 {
                    let _ = io::write(fd, &buf[..n]);
                }
            }
            routine.runtime().stop();
            0
        })
        .unwrap();

    let client_thread = thread::spawn(move || {
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"ping").unwrap();
        let mut reply = [0u8; 64];
        let n = client.read(&mut reply).unwrap();
        assert_eq!(&reply[..n], b"ping");
    });

    runtime.run_loop().unwrap();
    client_thread.join().unwrap();
}

#[test]
fn connection_with_no_bytes_closes_cleanly() {
    let _lock = GUARD.lock().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let listen_fd = listener.as_raw_fd();
    std::mem::forget(listener);

    let mut runtime = Runtime::new(RuntimeConfig::default()).unwrap();
    runtime
        .add_listener(listen_fd, |fd, routine| {
            let mut buf = [0u8; 64];
            let _ = io::read(fd, &mut buf);
            routine.runtime().stop();
            0
        })
        .unwrap();

    let client_thread = thread::spawn(move || {
        let client = TcpStream::connect(addr).unwrap();
        drop(client);
    });

    runtime.run_loop().unwrap();
    client_thread.join().unwrap();
}
