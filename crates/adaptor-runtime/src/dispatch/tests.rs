//! Tests for request dispatch.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use adaptor_protocol::{
    ErrorKind, Frame, LifecycleState, LogRecord, OutputStream, Payload, Request, Response,
    ResponseStatus,
};
use rstest::{fixture, rstest};

use super::{Dispatcher, ServeOutcome};
use crate::cancel::{CancellationToken, lock};
use crate::lifecycle::Lifecycle;
use crate::test_support::{CallLog, ScriptedAdaptor, calls, directive};
use crate::transport::{Connection, ServerHandle, TransportError};

type Sent = Arc<Mutex<Vec<Frame>>>;

/// Connection replaying one incoming frame and recording what is sent.
struct ScriptedConnection {
    incoming: Option<Result<Frame, TransportError>>,
    sent: Sent,
    accept_sends: Option<usize>,
}

impl ScriptedConnection {
    fn new(frame: Frame) -> (Self, Sent) {
        let sent = Sent::default();
        (
            Self {
                incoming: Some(Ok(frame)),
                sent: Arc::clone(&sent),
                accept_sends: None,
            },
            sent,
        )
    }

    fn silent() -> Self {
        Self {
            incoming: None,
            sent: Sent::default(),
            accept_sends: None,
        }
    }
}

impl Connection for ScriptedConnection {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if let Some(remaining) = self.accept_sends.as_mut() {
            if *remaining == 0 {
                return Err(TransportError::Closed);
            }
            *remaining -= 1;
        }
        lock(&self.sent).push(frame.clone());
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Frame>, TransportError> {
        self.incoming.take().transpose()
    }

    fn set_receive_timeout(&mut self, _timeout: Option<Duration>) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// Server handing out queued connections. Once the queue is empty a
/// blocking accept behaves like a signal arriving: the token is canceled and
/// the waker connects without sending anything. Polling never blocks and
/// never cancels.
struct ScriptedServer {
    queue: VecDeque<ScriptedConnection>,
    token: CancellationToken,
    accepted: usize,
}

impl ServerHandle for ScriptedServer {
    fn address(&self) -> &str {
        "scripted"
    }

    fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError> {
        self.accepted += 1;
        Ok(match self.queue.pop_front() {
            Some(connection) => Box::new(connection),
            None => {
                self.token.cancel();
                Box::new(ScriptedConnection::silent())
            }
        })
    }

    fn try_accept(&mut self) -> Result<Option<Box<dyn Connection>>, TransportError> {
        Ok(self
            .queue
            .pop_front()
            .map(|connection| Box::new(connection) as Box<dyn Connection>))
    }
}

struct Harness {
    dispatcher: Dispatcher,
    token: CancellationToken,
    calls: CallLog,
    adaptor_overlaps: Arc<std::sync::atomic::AtomicUsize>,
}

impl Harness {
    fn server(&self, connections: Vec<ScriptedConnection>) -> ScriptedServer {
        ScriptedServer {
            queue: connections.into(),
            token: self.token.clone(),
            accepted: 0,
        }
    }
}

fn harness_with(adaptor: ScriptedAdaptor) -> Harness {
    let token = CancellationToken::new(Duration::from_secs(1));
    let calls = Arc::clone(&adaptor.calls);
    let adaptor_overlaps = Arc::clone(&adaptor.overlapped);
    let dispatcher = Dispatcher::new(Lifecycle::new(Box::new(adaptor), token.clone()));
    Harness {
        dispatcher,
        token,
        calls,
        adaptor_overlaps,
    }
}

#[fixture]
fn started() -> Harness {
    let (adaptor, _) = ScriptedAdaptor::new();
    let mut harness = harness_with(adaptor);
    assert!(harness.dispatcher.start());
    harness
}

fn run_with(key: &str, value: serde_json::Value) -> Frame {
    let mut payload = Payload::new();
    payload.insert(key.to_owned(), value);
    Frame::Request(Request::run(payload))
}

fn response(frames: &[Frame]) -> Response {
    match frames.last() {
        Some(Frame::Response(response)) => response.clone(),
        other => panic!("expected a trailing response, got {other:?}"),
    }
}

#[rstest]
fn run_output_precedes_the_response(mut started: Harness) {
    let (mut connection, sent) = ScriptedConnection::new(run_with("echo", "hello".into()));

    started.dispatcher.handle(&mut connection);

    let frames = lock(&sent).clone();
    assert_eq!(
        frames.first(),
        Some(&Frame::Log(LogRecord::new(OutputStream::Stdout, "\"hello\"\n")))
    );
    assert_eq!(response(&frames), Response::ok(LifecycleState::Ready));
}

#[rstest]
fn failed_run_keeps_the_daemon_ready(mut started: Harness) {
    let (mut failing, sent) = ScriptedConnection::new(Frame::Request(Request::run(directive("fail"))));
    started.dispatcher.handle(&mut failing);

    let failed = response(&lock(&sent));
    assert_eq!(failed.status, ResponseStatus::Failed);
    assert_eq!(failed.exit_code, 1);
    assert_eq!(failed.state, LifecycleState::Ready);
    assert!(lock(&sent).iter().any(|frame| matches!(
        frame,
        Frame::Log(record) if record.text.starts_with("openjd_fail: ")
    )));

    let (mut next, sent_next) = ScriptedConnection::new(Frame::Request(Request::run(Payload::new())));
    started.dispatcher.handle(&mut next);
    assert!(response(&lock(&sent_next)).is_ok());
}

#[rstest]
fn status_reports_state_without_side_effects(mut started: Harness) {
    let (mut connection, sent) = ScriptedConnection::new(Frame::Request(Request::status()));
    started.dispatcher.handle(&mut connection);

    assert_eq!(*lock(&sent), [Frame::Response(Response::ok(LifecycleState::Ready))]);
    assert_eq!(calls(&started.calls), ["start"]);
}

#[test]
fn failed_start_is_visible_through_status_and_stop_still_cleans_up() {
    let (mut adaptor, _) = ScriptedAdaptor::new();
    adaptor.fail_start = true;
    let mut harness = harness_with(adaptor);
    assert!(!harness.dispatcher.start());

    let (status, status_sent) = ScriptedConnection::new(Frame::Request(Request::status()));
    let (run, run_sent) = ScriptedConnection::new(Frame::Request(Request::run(Payload::new())));
    let (stop, stop_sent) = ScriptedConnection::new(Frame::Request(Request::stop()));
    let mut server = harness.server(vec![status, run, stop]);

    let outcome = harness.dispatcher.serve(&mut server).expect("serve");

    let status = response(&lock(&status_sent));
    assert_eq!(status.state, LifecycleState::Canceled);
    assert_eq!(status.error.map(|error| error.kind), Some(ErrorKind::Callback));
    assert_eq!(response(&lock(&run_sent)).error.map(|error| error.kind), Some(ErrorKind::InvalidTransition));
    assert_eq!(response(&lock(&stop_sent)).state, LifecycleState::CleanedUp);
    assert_eq!(outcome, ServeOutcome { clean: false });
    assert_eq!(calls(&harness.calls), ["start", "stop", "cleanup"]);
}

#[rstest]
fn stop_ends_serving_and_queued_clients_are_still_answered(mut started: Harness) {
    let (run, _) = ScriptedConnection::new(Frame::Request(Request::run(Payload::new())));
    let (stop, stop_sent) = ScriptedConnection::new(Frame::Request(Request::stop()));
    let (late_status, status_sent) = ScriptedConnection::new(Frame::Request(Request::status()));
    let (late_stop, late_stop_sent) = ScriptedConnection::new(Frame::Request(Request::stop()));
    let mut server = started.server(vec![run, stop, late_status, late_stop]);

    let outcome = started.dispatcher.serve(&mut server).expect("serve");

    assert!(outcome.clean);
    assert_eq!(server.accepted, 2);
    assert_eq!(response(&lock(&stop_sent)), Response::ok(LifecycleState::CleanedUp));
    assert_eq!(*lock(&status_sent), [Frame::Response(Response::ok(LifecycleState::CleanedUp))]);
    assert_eq!(*lock(&late_stop_sent), [Frame::Response(Response::ok(LifecycleState::CleanedUp))]);
    assert_eq!(calls(&started.calls), ["start", "run", "stop", "cleanup"]);
    assert!(!started.token.is_cancelled());
}

#[rstest]
fn stop_queued_behind_a_canceled_run_is_answered(mut started: Harness) {
    let (run, run_sent) = ScriptedConnection::new(Frame::Request(Request::run(directive("cancel"))));
    let (stop, stop_sent) = ScriptedConnection::new(Frame::Request(Request::stop()));
    let mut server = started.server(vec![run, stop]);

    started.dispatcher.serve(&mut server).expect("serve");

    assert_eq!(server.accepted, 1);
    assert_eq!(response(&lock(&run_sent)).error.map(|error| error.kind), Some(ErrorKind::Canceled));
    let stop = response(&lock(&stop_sent));
    assert_eq!(stop.state, LifecycleState::CleanedUp);
    assert_eq!(stop.error.map(|error| error.kind), Some(ErrorKind::Canceled));
    assert_eq!(calls(&started.calls), ["start", "run", "cancel", "stop", "cleanup"]);
}

#[rstest]
fn cancellation_while_idle_tears_down(mut started: Harness) {
    let mut server = started.server(Vec::new());

    let outcome = started.dispatcher.serve(&mut server).expect("serve");

    assert!(outcome.clean);
    assert_eq!(
        started.dispatcher.lifecycle().state(),
        LifecycleState::CleanedUp
    );
    assert_eq!(calls(&started.calls), ["start", "cancel", "stop", "cleanup"]);
}

#[rstest]
fn cancellation_during_run_answers_canceled_then_tears_down(mut started: Harness) {
    let (run, sent) = ScriptedConnection::new(Frame::Request(Request::run(directive("cancel"))));
    let mut server = started.server(vec![run]);

    started.dispatcher.serve(&mut server).expect("serve");

    let canceled = response(&lock(&sent));
    assert_eq!(canceled.error.map(|error| error.kind), Some(ErrorKind::Canceled));
    assert_eq!(canceled.exit_code, 3);
    assert_eq!(calls(&started.calls), ["start", "run", "cancel", "stop", "cleanup"]);
}

#[rstest]
fn client_disconnect_does_not_abort_the_run(mut started: Harness) {
    let (mut connection, sent) = ScriptedConnection::new(run_with("echo", "lost".into()));
    connection.accept_sends = Some(0);

    started.dispatcher.handle(&mut connection);

    assert!(lock(&sent).is_empty());
    assert_eq!(calls(&started.calls), ["start", "run"]);
    assert_eq!(started.dispatcher.lifecycle().state(), LifecycleState::Ready);
}

#[rstest]
fn non_request_frames_are_protocol_errors(mut started: Harness) {
    let (mut connection, sent) =
        ScriptedConnection::new(Frame::Response(Response::ok(LifecycleState::Ready)));

    started.dispatcher.handle(&mut connection);

    let rejected = response(&lock(&sent));
    assert_eq!(rejected.error.map(|error| error.kind), Some(ErrorKind::Protocol));
    assert_eq!(calls(&started.calls), ["start"]);
}

#[cfg(unix)]
#[rstest]
fn concurrent_clients_are_served_one_at_a_time(mut started: Harness) {
    use crate::transport::{FramedTransport, Transport};

    const CLIENTS: usize = 6;
    let dir = tempfile::tempdir().expect("temp dir");
    let address = dir.path().join("dispatch.sock").display().to_string();
    let mut server = FramedTransport.listen(&address).expect("listen");
    let barrier = Arc::new(Barrier::new(CLIENTS));

    thread::scope(|scope| {
        let dispatcher = &mut started.dispatcher;
        let serving = scope.spawn(move || dispatcher.serve(server.as_mut()));
        let clients: Vec<_> = (0..CLIENTS)
            .map(|n| {
                let address = address.clone();
                let barrier = Arc::clone(&barrier);
                scope.spawn(move || {
                    let mut payload = directive("pause");
                    payload.insert("echo".to_owned(), n.into());
                    barrier.wait();
                    (n, exchange(&address, Request::run(payload)))
                })
            })
            .collect();
        for client in clients {
            let (n, frames) = client.join().expect("client thread");
            assert_eq!(
                frames,
                [
                    Frame::Log(LogRecord::new(OutputStream::Stdout, format!("{n}\n"))),
                    Frame::Response(Response::ok(LifecycleState::Ready)),
                ]
            );
        }
        let stop = exchange(&address, Request::stop());
        assert_eq!(stop, [Frame::Response(Response::ok(LifecycleState::CleanedUp))]);
        let outcome = serving.join().expect("serving thread").expect("serve");
        assert!(outcome.clean);
    });

    assert_eq!(started.adaptor_overlaps.load(Ordering::SeqCst), 0);
    let calls = calls(&started.calls);
    assert_eq!(calls.iter().filter(|call| *call == "run").count(), CLIENTS);
    assert_eq!(calls.last().map(String::as_str), Some("cleanup"));
}

/// Sends one request over a fresh framed connection and collects every frame
/// until the daemon hangs up.
#[cfg(unix)]
fn exchange(address: &str, request: Request) -> Vec<Frame> {
    use crate::transport::{FramedTransport, Transport};

    let mut connection = FramedTransport
        .connect(address, Duration::from_secs(5))
        .expect("connect");
    connection.send(&Frame::Request(request)).expect("send");
    let mut frames = Vec::new();
    while let Some(frame) = connection.receive().expect("receive") {
        frames.push(frame);
    }
    frames
}
