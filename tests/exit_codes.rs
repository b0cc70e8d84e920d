//! Exit code behavior of the waybridge binary: the application's status is
//! propagated on clean sessions, usage errors and bring-up failures are
//! distinguishable, and diagnostics land on stderr.

use std::io::Read;
use std::os::unix::net::UnixListener;
use std::thread;

use assert_cmd::Command;

#[test]
fn usage_error_without_required_socket() {
    Command::cargo_bin("waybridge")
        .expect("binary")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn bring_up_failure_exits_one_with_prefixed_diagnostic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = Command::cargo_bin("waybridge")
        .expect("binary")
        .arg("--oneshot")
        .arg("--socket")
        .arg(dir.path().join("no-such-channel"))
        .arg("--display")
        .arg(dir.path().join("wayland-e0"))
        .arg("--")
        .arg("true")
        .output()
        .expect("run binary");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("waybridge:"),
        "diagnostic must carry the tool prefix, got: {stderr}"
    );
}

#[test]
fn application_exit_status_is_propagated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let channel_path = dir.path().join("channel");
    let listener = UnixListener::bind(&channel_path).expect("bind channel");
    let acceptor = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut token = [0u8; 16];
        stream.read_exact(&mut token).expect("handshake token");
        stream
    });

    Command::cargo_bin("waybridge")
        .expect("binary")
        .arg("--oneshot")
        .arg("--socket")
        .arg(&channel_path)
        .arg("--display")
        .arg(dir.path().join("wayland-e1"))
        .arg("--")
        .arg("sh")
        .arg("-c")
        .arg("exit 7")
        .assert()
        .failure()
        .code(7);

    drop(acceptor.join().expect("channel acceptor"));
}
