//! Control-socket protocol: command parsing, request/response plumbing.

use ctmirror_core::{ControlCommand, ControlSocket};
use std::os::unix::net::UnixDatagram;

#[test]
fn command_round_trip_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let server_path = dir.path().join("daemon.ctl");
    let client_path = dir.path().join("client.ctl");

    let server = ControlSocket::bind(&server_path).unwrap();
    let client = UnixDatagram::bind(&client_path).unwrap();

    client
        .send_to(b"stats", &server_path)
        .expect("send to daemon socket");

    let (cmd, peer) = server.recv_command().expect("command should be pending");
    assert_eq!(cmd, ControlCommand::Stats);

    server.reply(&peer, "cache:internal active objects: 0\n");
    let mut buf = [0u8; 4096];
    let n = client.recv(&mut buf).unwrap();
    let text = String::from_utf8_lossy(&buf[..n]);
    assert!(text.contains("active objects"));
}

#[test]
fn unknown_commands_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let server_path = dir.path().join("daemon.ctl");
    let client_path = dir.path().join("client.ctl");

    let server = ControlSocket::bind(&server_path).unwrap();
    let client = UnixDatagram::bind(&client_path).unwrap();
    client.send_to(b"make-coffee", &server_path).unwrap();

    assert!(server.recv_command().is_none());
}

#[test]
fn empty_socket_reports_no_command() {
    let dir = tempfile::tempdir().unwrap();
    let server = ControlSocket::bind(&dir.path().join("daemon.ctl")).unwrap();
    assert!(server.recv_command().is_none());
}

#[test]
fn socket_file_is_removed_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daemon.ctl");
    {
        let _server = ControlSocket::bind(&path).unwrap();
        assert!(path.exists());
    }
    assert!(!path.exists());
}
