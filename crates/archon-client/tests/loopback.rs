//! End-to-end tests against a loopback TCP listener standing in for an
//! Archon controller, in the spirit of the teacher's `mock_serial`
//! harness (`crates/hardware/src/drivers/mock_serial.rs`): script the
//! peer's bytes, drive the real client against them.

use archon_core::data::ControllerDescriptor;
use archon_core::error::ArchonError;
use archon_core::link::ControllerLink;
use archon_client::{ConnectOptions, ControllerClient};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn spawn_descriptor() -> (ControllerDescriptor, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let descriptor = ControllerDescriptor {
        name: "ccd1".into(),
        host: addr.ip().to_string(),
        port: addr.port(),
        detectors: vec![],
    };
    (descriptor, listener)
}

#[tokio::test]
async fn connect_sends_initial_status_and_observes_power_good() {
    let (descriptor, listener) = spawn_descriptor().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut header = [0u8; 3];
        socket.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], b'>');
        let mut rest = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            socket.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            rest.push(byte[0]);
        }
        assert_eq!(&rest, b"STATUS");
        let reply = format!("<{}POWER=GOOD\n", std::str::from_utf8(&header[1..3]).unwrap());
        socket.write_all(reply.as_bytes()).await.unwrap();
        socket
    });

    let client = ControllerClient::connect(descriptor, ConnectOptions::default())
        .await
        .unwrap();
    server.await.unwrap();

    assert_eq!(
        client.status() & archon_core::status::flag::POWERON,
        archon_core::status::flag::POWERON
    );
}

#[tokio::test]
async fn send_round_trips_a_text_reply() {
    let (descriptor, listener) = spawn_descriptor().await;

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        // initial STATUS from connect()
        let mut header = [0u8; 3];
        socket.read_exact(&mut header).await.unwrap();
        drain_line(&mut socket).await;
        let id = std::str::from_utf8(&header[1..3]).unwrap();
        socket
            .write_all(format!("<{id}POWER=GOOD\n").as_bytes())
            .await
            .unwrap();

        // the test's own PING command
        let mut header = [0u8; 3];
        socket.read_exact(&mut header).await.unwrap();
        let line = drain_line(&mut socket).await;
        assert_eq!(line, "PING");
        let id = std::str::from_utf8(&header[1..3]).unwrap();
        socket
            .write_all(format!("<{id}PONG\n").as_bytes())
            .await
            .unwrap();
    });

    let client = ControllerClient::connect(descriptor, ConnectOptions::default())
        .await
        .unwrap();
    let reply = client.send("PING", None, false).await.unwrap();
    assert_eq!(reply, "PONG\n");
}

#[tokio::test]
async fn nak_reply_surfaces_as_command_failed() {
    let (descriptor, listener) = spawn_descriptor().await;

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut header = [0u8; 3];
        socket.read_exact(&mut header).await.unwrap();
        drain_line(&mut socket).await;
        let id = std::str::from_utf8(&header[1..3]).unwrap();
        socket
            .write_all(format!("<{id}POWER=GOOD\n").as_bytes())
            .await
            .unwrap();

        let mut header = [0u8; 3];
        socket.read_exact(&mut header).await.unwrap();
        drain_line(&mut socket).await;
        let id = std::str::from_utf8(&header[1..3]).unwrap();
        socket.write_all(format!("?{id}\n").as_bytes()).await.unwrap();
    });

    let client = ControllerClient::connect(descriptor, ConnectOptions::default())
        .await
        .unwrap();
    let err = client.send("BOGUS", None, false).await.unwrap_err();
    assert!(matches!(err, ArchonError::CommandFailed { .. }));
}

#[tokio::test]
async fn send_times_out_when_the_controller_never_replies() {
    let (descriptor, listener) = spawn_descriptor().await;

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut header = [0u8; 3];
        socket.read_exact(&mut header).await.unwrap();
        drain_line(&mut socket).await;
        let id = std::str::from_utf8(&header[1..3]).unwrap();
        socket
            .write_all(format!("<{id}POWER=GOOD\n").as_bytes())
            .await
            .unwrap();

        // Consume the SLOW command but never reply; keep socket open.
        let mut header = [0u8; 3];
        socket.read_exact(&mut header).await.unwrap();
        drain_line(&mut socket).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let client = ControllerClient::connect(descriptor, ConnectOptions::default())
        .await
        .unwrap();
    let err = client
        .send("SLOW", Some(Duration::from_millis(50)), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ArchonError::Timeout { .. }));
}

#[tokio::test]
async fn disconnect_fails_outstanding_commands_and_resets_status() {
    let (descriptor, listener) = spawn_descriptor().await;

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut header = [0u8; 3];
        socket.read_exact(&mut header).await.unwrap();
        drain_line(&mut socket).await;
        let id = std::str::from_utf8(&header[1..3]).unwrap();
        socket
            .write_all(format!("<{id}POWER=GOOD\n").as_bytes())
            .await
            .unwrap();
        // Accept the next command, then drop the socket without replying.
        let mut header = [0u8; 3];
        socket.read_exact(&mut header).await.unwrap();
        drain_line(&mut socket).await;
        drop(socket);
    });

    let client = ControllerClient::connect(descriptor, ConnectOptions::default())
        .await
        .unwrap();
    let err = client.send("DOOMED", None, false).await.unwrap_err();
    assert!(matches!(err, ArchonError::Disconnected { .. }));

    // Give the reader task a moment to process EOF and update status.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        client.status(),
        archon_core::status::flag::UNKNOWN | archon_core::status::flag::ERROR
    );
}

async fn drain_line(socket: &mut tokio::net::TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        socket.read_exact(&mut byte).await.unwrap();
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).unwrap()
}
