//! Both transports carry the same exchange over real sockets.
#![cfg(unix)]

use std::thread;
use std::time::Duration;

use adaptor_protocol::{
    Frame, LifecycleState, LogRecord, OutputStream, Payload, Request, Response, TransportKind,
};
use adaptor_runtime::transport::{TransportError, for_kind};
use rstest::rstest;
use serde_json::json;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(5);

fn run_payload() -> Payload {
    let mut payload = Payload::new();
    payload.insert("frame".to_owned(), json!(12));
    payload
}

#[rstest]
#[case::framed(TransportKind::Pipe)]
#[case::http(TransportKind::Socket)]
fn request_output_and_response_cross_the_wire(#[case] kind: TransportKind) {
    let dir = TempDir::new().expect("temp dir");
    let address = dir.path().join("daemon.sock");
    let transport = for_kind(kind).expect("transport");
    let mut server = transport
        .listen(address.to_str().expect("utf8 path"))
        .expect("listen");
    let bound = server.address().to_owned();

    let serving = thread::spawn(move || {
        let mut connection = server.accept().expect("accept");
        let request = connection.receive().expect("receive").expect("request frame");
        connection
            .send(&Frame::Log(LogRecord::new(OutputStream::Stdout, "rendering\n")))
            .expect("send log");
        connection
            .send(&Frame::Log(LogRecord::new(OutputStream::Stderr, "warning\n")))
            .expect("send log");
        connection
            .send(&Frame::Response(Response::ok(LifecycleState::Ready)))
            .expect("send response");
        connection.close();
        request
    });

    let mut client = transport.connect(&bound, TIMEOUT).expect("connect");
    client
        .send(&Frame::Request(Request::run(run_payload())))
        .expect("send request");
    let mut frames = Vec::new();
    while let Some(frame) = client.receive().expect("receive") {
        frames.push(frame);
    }

    let received = serving.join().expect("server thread");
    assert_eq!(received, Frame::Request(Request::run(run_payload())));
    assert_eq!(
        frames,
        vec![
            Frame::Log(LogRecord::new(OutputStream::Stdout, "rendering\n")),
            Frame::Log(LogRecord::new(OutputStream::Stderr, "warning\n")),
            Frame::Response(Response::ok(LifecycleState::Ready)),
        ]
    );
}

#[rstest]
#[case::framed(TransportKind::Pipe)]
#[case::http(TransportKind::Socket)]
fn connecting_to_a_missing_address_is_refused(#[case] kind: TransportKind) {
    let dir = TempDir::new().expect("temp dir");
    let address = dir.path().join("absent.sock");
    let transport = for_kind(kind).expect("transport");
    let error = transport
        .connect(address.to_str().expect("utf8 path"), TIMEOUT)
        .err()
        .expect("connect fails");
    assert!(error.is_refused(), "unexpected error: {error}");
}

#[rstest]
#[case::framed(TransportKind::Pipe)]
#[case::http(TransportKind::Socket)]
fn a_live_address_cannot_be_bound_twice(#[case] kind: TransportKind) {
    let dir = TempDir::new().expect("temp dir");
    let address = dir.path().join("daemon.sock");
    let path = address.to_str().expect("utf8 path");
    let transport = for_kind(kind).expect("transport");
    let _first = transport.listen(path).expect("first listen");
    let error = transport.listen(path).err().expect("second listen fails");
    assert!(matches!(error, TransportError::AddressInUse { .. }));
}

#[rstest]
#[case::framed(TransportKind::Pipe)]
#[case::http(TransportKind::Socket)]
fn silent_servers_time_out(#[case] kind: TransportKind) {
    let dir = TempDir::new().expect("temp dir");
    let address = dir.path().join("daemon.sock");
    let transport = for_kind(kind).expect("transport");
    let mut server = transport
        .listen(address.to_str().expect("utf8 path"))
        .expect("listen");
    let bound = server.address().to_owned();
    let holding = thread::spawn(move || {
        let connection = server.accept().expect("accept");
        thread::sleep(Duration::from_millis(500));
        drop(connection);
    });

    let mut client = transport.connect(&bound, TIMEOUT).expect("connect");
    client
        .set_receive_timeout(Some(Duration::from_millis(100)))
        .expect("set timeout");
    client
        .send(&Frame::Request(Request::status()))
        .expect("send request");
    let error = client.receive().expect_err("receive times out");
    assert!(matches!(error, TransportError::Timeout { .. }), "unexpected error: {error}");
    holding.join().expect("server thread");
}
