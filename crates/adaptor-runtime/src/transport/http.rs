//! HTTP/1.1 over a Unix domain socket.
//!
//! A client issues one request per connection: `PUT /run`, `PUT /stop` or
//! `GET /status` with the [`Request`] as a JSON body. The daemon answers
//! `200` with a chunked body holding one newline-terminated JSON frame per
//! chunk. Log frames stream while the request is handled and the body ends
//! after the response frame.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use adaptor_protocol::{Action, Frame, Request, TransportKind};
use tracing::{debug, warn};

use super::framed::MAX_FRAME_BYTES;
use super::unix::{self, BoundSocket};
use super::{AddressNamespace, Connection, ServerHandle, TRANSPORT_TARGET, Transport, TransportError};

const MAX_HEAD_BYTES: usize = 16 * 1024;
pub(crate) const MAX_HEADERS: usize = 32;
const MAX_CHUNK_LINE_BYTES: usize = 64;

/// The socket transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTransport;

impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn namespace(&self) -> AddressNamespace {
        AddressNamespace::Filesystem
    }

    fn listen(&self, address: &str) -> Result<Box<dyn ServerHandle>, TransportError> {
        let socket = BoundSocket::bind(address)?;
        Ok(Box::new(HttpServer { socket }))
    }

    fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn Connection>, TransportError> {
        let stream = unix::connect(address, timeout)?;
        Ok(Box::new(HttpClientConnection::new(stream)))
    }
}

struct HttpServer {
    socket: BoundSocket,
}

impl ServerHandle for HttpServer {
    fn address(&self) -> &str {
        self.socket.address()
    }

    fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError> {
        let stream = self.socket.accept()?;
        Ok(Box::new(HttpServerConnection::new(stream)))
    }

    fn try_accept(&mut self) -> Result<Option<Box<dyn Connection>>, TransportError> {
        let pending = self.socket.try_accept()?;
        Ok(pending.map(|stream| Box::new(HttpServerConnection::new(stream)) as Box<dyn Connection>))
    }
}

fn route(action: Action) -> (&'static str, &'static str) {
    match action {
        Action::Run => ("PUT", "/run"),
        Action::Stop => ("PUT", "/stop"),
        Action::Status => ("GET", "/status"),
    }
}

fn action_for_path(path: &str) -> Option<Action> {
    match path {
        "/run" => Some(Action::Run),
        "/stop" => Some(Action::Stop),
        "/status" => Some(Action::Status),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerPhase {
    AwaitingRequest,
    Received,
    Streaming,
    Finished,
}

/// Daemon side of one HTTP exchange.
pub(crate) struct HttpServerConnection {
    stream: Option<BufReader<UnixStream>>,
    phase: ServerPhase,
}

impl HttpServerConnection {
    pub(crate) fn new(stream: UnixStream) -> Self {
        Self {
            stream: Some(BufReader::new(stream)),
            phase: ServerPhase::AwaitingRequest,
        }
    }

    fn reader(&mut self) -> Result<&mut BufReader<UnixStream>, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    fn reject(&mut self, status: u16, reason: &str, extra_header: Option<&str>) -> TransportError {
        let message = format!("{status} {reason}");
        let mut head = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n",
            message.len()
        );
        if let Some(header) = extra_header {
            head.push_str(header);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head.push_str(&message);
        if let Ok(reader) = self.reader() {
            let stream = reader.get_mut();
            if let Err(error) = stream.write_all(head.as_bytes()).and_then(|()| stream.flush()) {
                debug!(target: TRANSPORT_TARGET, %error, "failed to send rejection");
            }
        }
        self.phase = ServerPhase::Finished;
        warn!(target: TRANSPORT_TARGET, status, reason, "rejected request");
        TransportError::framing(format!("rejected request: {message}"))
    }

    fn read_request(&mut self) -> Result<Option<Frame>, TransportError> {
        let reader = self.reader()?;
        let Some(head) = read_head(reader)? else {
            return Ok(None);
        };
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => return Err(self.reject(400, "Bad Request", None)),
            Err(error) => {
                debug!(target: TRANSPORT_TARGET, %error, "unparseable request head");
                return Err(self.reject(400, "Bad Request", None));
            }
        }
        let method = parsed.method.unwrap_or_default().to_owned();
        let path = parsed.path.unwrap_or_default().to_owned();
        let content_length = match content_length(parsed.headers) {
            Ok(length) => length.unwrap_or(0),
            Err(error) => {
                debug!(target: TRANSPORT_TARGET, %error, "bad content length");
                return Err(self.reject(400, "Bad Request", None));
            }
        };

        let Some(action) = action_for_path(&path) else {
            return Err(self.reject(404, "Not Found", None));
        };
        let (expected_method, _) = route(action);
        if method != expected_method {
            let allow = format!("Allow: {expected_method}");
            return Err(self.reject(405, "Method Not Allowed", Some(&allow)));
        }
        if content_length > MAX_FRAME_BYTES {
            return Err(self.reject(413, "Payload Too Large", None));
        }

        let mut body = vec![0_u8; content_length];
        self.reader()?
            .read_exact(&mut body)
            .map_err(|error| TransportError::io("reading request body", error))?;
        let request = if body.is_empty() {
            Request {
                action,
                payload: None,
            }
        } else {
            match serde_json::from_slice::<Request>(&body) {
                Ok(request) if request.action == action => request,
                Ok(_) => return Err(self.reject(400, "Bad Request", None)),
                Err(error) => {
                    debug!(target: TRANSPORT_TARGET, %error, "undecodable request body");
                    return Err(self.reject(400, "Bad Request", None));
                }
            }
        };
        debug!(target: TRANSPORT_TARGET, %method, %path, "received request");
        Ok(Some(Frame::Request(request)))
    }
}

impl Connection for HttpServerConnection {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        match self.phase {
            ServerPhase::Finished => return Err(TransportError::Closed),
            ServerPhase::AwaitingRequest => {
                return Err(TransportError::framing("no request to answer"));
            }
            ServerPhase::Received | ServerPhase::Streaming => {}
        }
        let mut body = frame
            .encode()
            .map_err(|source| TransportError::Encode { source })?;
        body.push(b'\n');
        let mut out = Vec::with_capacity(body.len() + 128);
        if self.phase == ServerPhase::Received {
            out.extend_from_slice(
                b"HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            );
        }
        out.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(b"\r\n");
        let finished = matches!(frame, Frame::Response(_));
        if finished {
            out.extend_from_slice(b"0\r\n\r\n");
        }
        let stream = self.reader()?.get_mut();
        stream
            .write_all(&out)
            .and_then(|()| stream.flush())
            .map_err(|source| TransportError::io("writing response chunk", source))?;
        self.phase = if finished {
            ServerPhase::Finished
        } else {
            ServerPhase::Streaming
        };
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Frame>, TransportError> {
        if self.phase != ServerPhase::AwaitingRequest {
            return Ok(None);
        }
        let frame = self.read_request()?;
        if frame.is_some() {
            self.phase = ServerPhase::Received;
        }
        Ok(frame)
    }

    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.reader()?
            .get_ref()
            .set_read_timeout(timeout)
            .map_err(|source| TransportError::io("setting receive timeout", source))
    }

    fn close(&mut self) {
        if let Some(reader) = self.stream.take() {
            if let Err(error) = reader.get_ref().shutdown(std::net::Shutdown::Both) {
                debug!(target: TRANSPORT_TARGET, %error, "stream already disconnected");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientPhase {
    Idle,
    AwaitingHead,
    Streaming,
    Finished,
}

/// Client side of one HTTP exchange.
pub(crate) struct HttpClientConnection {
    stream: Option<BufReader<UnixStream>>,
    phase: ClientPhase,
}

impl HttpClientConnection {
    pub(crate) fn new(stream: UnixStream) -> Self {
        Self {
            stream: Some(BufReader::new(stream)),
            phase: ClientPhase::Idle,
        }
    }

    fn reader(&mut self) -> Result<&mut BufReader<UnixStream>, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    fn read_response_head(&mut self) -> Result<(), TransportError> {
        let reader = self.reader()?;
        let head = read_head(reader)?
            .ok_or_else(|| TransportError::framing("daemon closed the connection without answering"))?;
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(TransportError::framing("incomplete response head"));
            }
            Err(error) => {
                return Err(TransportError::framing(format!("invalid response head: {error}")));
            }
        }
        let code = parsed.code.unwrap_or_default();
        if code != 200 {
            let reason = parsed.reason.unwrap_or_default().to_owned();
            return Err(TransportError::framing(format!("daemon answered {code} {reason}")));
        }
        let chunked = parsed.headers.iter().any(|header| {
            header.name.eq_ignore_ascii_case("transfer-encoding")
                && String::from_utf8_lossy(header.value)
                    .to_ascii_lowercase()
                    .contains("chunked")
        });
        if !chunked {
            return Err(TransportError::framing("response body is not chunked"));
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.phase {
            ClientPhase::Idle => return Err(TransportError::framing("no request has been sent")),
            ClientPhase::Finished => return Ok(None),
            ClientPhase::AwaitingHead => {
                self.read_response_head()?;
                self.phase = ClientPhase::Streaming;
            }
            ClientPhase::Streaming => {}
        }
        let Some(chunk) = read_chunk(self.reader()?)? else {
            self.phase = ClientPhase::Finished;
            return Ok(None);
        };
        let frame = Frame::decode(chunk.trim_ascii_end())
            .map_err(|error| TransportError::framing(format!("invalid frame body: {error}")))?;
        Ok(Some(frame))
    }
}

impl Connection for HttpClientConnection {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if self.phase != ClientPhase::Idle {
            return Err(TransportError::framing("one request per connection"));
        }
        let Frame::Request(request) = frame else {
            return Err(TransportError::framing("clients only send requests"));
        };
        let body = serde_json::to_vec(request).map_err(|source| TransportError::Encode { source })?;
        let (method, path) = route(request.action);
        let mut out = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(&body);
        let stream = self.reader()?.get_mut();
        stream
            .write_all(&out)
            .and_then(|()| stream.flush())
            .map_err(|source| TransportError::io("writing request", source))?;
        self.phase = ClientPhase::AwaitingHead;
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Frame>, TransportError> {
        let received = self.next_frame();
        if let Err(error) = &received {
            if !matches!(error, TransportError::Timeout { .. }) {
                debug!(target: TRANSPORT_TARGET, %error, "abandoning response stream");
                self.close();
                self.phase = ClientPhase::Finished;
            }
        }
        received
    }

    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.reader()?
            .get_ref()
            .set_read_timeout(timeout)
            .map_err(|source| TransportError::io("setting receive timeout", source))
    }

    fn close(&mut self) {
        if let Some(reader) = self.stream.take() {
            if let Err(error) = reader.get_ref().shutdown(std::net::Shutdown::Both) {
                debug!(target: TRANSPORT_TARGET, %error, "stream already disconnected");
            }
        }
    }
}

pub(crate) fn content_length(headers: &[httparse::Header<'_>]) -> Result<Option<usize>, TransportError> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("content-length"))
        .map(|header| {
            std::str::from_utf8(header.value)
                .ok()
                .and_then(|value| value.trim().parse::<usize>().ok())
                .ok_or_else(|| TransportError::framing("invalid content length"))
        })
        .transpose()
}

/// Appends one line to `buf`, reading at most `limit` bytes.
///
/// Returns the number of bytes read, zero at end of stream. A line that
/// reaches `limit` without a newline is a framing error, as is a timeout
/// after part of the line arrived.
fn read_line<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
    what: &'static str,
) -> Result<usize, TransportError> {
    let start = buf.len();
    let budget = u64::try_from(limit).unwrap_or(u64::MAX);
    match reader.by_ref().take(budget).read_until(b'\n', buf) {
        Ok(read) if read == limit && buf.last() != Some(&b'\n') => {
            Err(TransportError::framing(format!("{what} is too large")))
        }
        Ok(read) => Ok(read),
        Err(error)
            if buf.len() > start
                && matches!(error.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) =>
        {
            Err(TransportError::framing(format!("timed out inside a {what}")))
        }
        Err(error) => Err(TransportError::io("reading message", error)),
    }
}

/// Reads a message head up to and including the blank line.
///
/// Returns `None` when the stream ends before any byte arrives.
pub(crate) fn read_head<R: BufRead>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError> {
    let mut head = Vec::new();
    loop {
        let start = head.len();
        let remaining = MAX_HEAD_BYTES.saturating_sub(start);
        if remaining == 0 {
            return Err(TransportError::framing("message head is too large"));
        }
        let read = read_line(reader, &mut head, remaining, "message head")?;
        if read == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(TransportError::framing("stream ended inside a message head"));
        }
        let line = head.get(start..).unwrap_or_default();
        if line == b"\r\n" || line == b"\n" {
            return Ok(Some(head));
        }
    }
}

/// Reads one chunk of a chunked body, or `None` after the final chunk.
fn read_chunk<R: BufRead>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError> {
    let mut line = Vec::new();
    let read = read_line(reader, &mut line, MAX_CHUNK_LINE_BYTES, "chunk size line")?;
    if read == 0 {
        return Err(TransportError::framing("stream ended before the final chunk"));
    }
    let text = String::from_utf8_lossy(&line);
    let size_field = text.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_field, 16)
        .map_err(|_| TransportError::framing(format!("invalid chunk size {size_field:?}")))?;
    if size == 0 {
        skip_trailers(reader)?;
        return Ok(None);
    }
    if size > MAX_FRAME_BYTES + 1 {
        return Err(TransportError::framing(format!(
            "chunk of {size} bytes exceeds the frame limit"
        )));
    }
    let mut chunk = vec![0_u8; size];
    reader.read_exact(&mut chunk).map_err(|error| match error.kind() {
        ErrorKind::UnexpectedEof => TransportError::framing("stream ended inside a chunk"),
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            TransportError::framing("timed out inside a chunk")
        }
        _ => TransportError::io("reading chunk", error),
    })?;
    let mut terminator = [0_u8; 2];
    reader
        .read_exact(&mut terminator)
        .map_err(|_| TransportError::framing("chunk is missing its terminator"))?;
    if &terminator != b"\r\n" {
        return Err(TransportError::framing("chunk is missing its terminator"));
    }
    Ok(Some(chunk))
}

fn skip_trailers<R: BufRead>(reader: &mut R) -> Result<(), TransportError> {
    let mut consumed = 0;
    loop {
        let mut line = Vec::new();
        let remaining = MAX_HEAD_BYTES.saturating_sub(consumed);
        if remaining == 0 {
            return Err(TransportError::framing("trailers are too large"));
        }
        let read = read_line(reader, &mut line, remaining, "trailer")?;
        consumed += read;
        if read == 0 || line == b"\r\n" || line == b"\n" {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptor_protocol::{LifecycleState, LogRecord, OutputStream, Payload, Response};
    use rstest::rstest;
    use serde_json::json;
    use std::io::Read as _;
    use std::thread;

    fn pair() -> (HttpClientConnection, HttpServerConnection) {
        let (client, server) = UnixStream::pair().expect("socket pair");
        (
            HttpClientConnection::new(client),
            HttpServerConnection::new(server),
        )
    }

    #[test]
    fn request_and_streamed_response_round_trip() {
        let (mut client, mut server) = pair();
        let payload: Payload = json!({"frame": 1}).as_object().cloned().expect("object");
        let request = Request::run(payload);
        client.send(&Frame::Request(request.clone())).expect("send request");

        let daemon = thread::spawn(move || {
            let received = server.receive().expect("receive").expect("request");
            server
                .send(&Frame::Log(LogRecord::new(OutputStream::Stdout, "line\n")))
                .expect("send log");
            server
                .send(&Frame::Response(Response::ok(LifecycleState::Ready)))
                .expect("send response");
            server.close();
            received
        });

        let log = client.receive().expect("log").expect("log frame");
        let response = client.receive().expect("response").expect("response frame");
        assert_eq!(client.receive().expect("end"), None);
        assert_eq!(
            log,
            Frame::Log(LogRecord::new(OutputStream::Stdout, "line\n"))
        );
        assert_eq!(response, Frame::Response(Response::ok(LifecycleState::Ready)));
        assert_eq!(daemon.join().expect("join"), Frame::Request(request));
    }

    #[rstest]
    #[case::unknown_path("GET /nope HTTP/1.1\r\nContent-Length: 0\r\n\r\n", "404")]
    #[case::wrong_method("POST /run HTTP/1.1\r\nContent-Length: 0\r\n\r\n", "405")]
    #[case::bad_body("PUT /run HTTP/1.1\r\nContent-Length: 3\r\n\r\n{x}", "400")]
    #[case::mismatched_action(
        "PUT /stop HTTP/1.1\r\nContent-Length: 17\r\n\r\n{\"action\":\"run\"}\n",
        "400"
    )]
    fn invalid_requests_are_rejected(#[case] raw: &str, #[case] status: &str) {
        let (mut client, server) = UnixStream::pair().expect("socket pair");
        let mut connection = HttpServerConnection::new(server);
        client.write_all(raw.as_bytes()).expect("write raw request");

        let error = connection.receive().expect_err("rejected");
        assert!(matches!(error, TransportError::Framing { .. }));
        assert!(matches!(
            connection.send(&Frame::Response(Response::ok(LifecycleState::Ready))),
            Err(TransportError::Closed)
        ));
        connection.close();

        let mut answer = String::new();
        client.read_to_string(&mut answer).expect("read answer");
        assert!(answer.starts_with(&format!("HTTP/1.1 {status}")), "{answer}");
    }

    #[test]
    fn empty_status_body_is_accepted() {
        let (mut client, server) = UnixStream::pair().expect("socket pair");
        let mut connection = HttpServerConnection::new(server);
        client
            .write_all(b"GET /status HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .expect("write");

        let frame = connection.receive().expect("receive");
        assert_eq!(frame, Some(Frame::Request(Request::status())));
    }

    #[test]
    fn silent_peer_yields_no_request() {
        let (client, server) = UnixStream::pair().expect("socket pair");
        drop(client);
        let mut connection = HttpServerConnection::new(server);
        assert_eq!(connection.receive().expect("receive"), None);
    }

    #[test]
    fn chunks_survive_byte_at_a_time_delivery() {
        let raw = b"5\r\nhello\r\n3;ext=1\r\nabc\r\n0\r\nTrailer: x\r\n\r\n";
        let mut reader = BufReader::with_capacity(1, &raw[..]);
        assert_eq!(read_chunk(&mut reader).expect("first"), Some(b"hello".to_vec()));
        assert_eq!(read_chunk(&mut reader).expect("second"), Some(b"abc".to_vec()));
        assert_eq!(read_chunk(&mut reader).expect("last"), None);
    }

    #[rstest]
    #[case::bad_size(&b"zz\r\nhello\r\n"[..])]
    #[case::missing_terminator(&b"5\r\nhelloXX"[..])]
    #[case::truncated(&b"5\r\nhel"[..])]
    #[case::no_final_chunk(&b""[..])]
    fn malformed_chunks_are_framing_errors(#[case] raw: &[u8]) {
        let mut reader = BufReader::with_capacity(1, raw);
        let error = read_chunk(&mut reader).expect_err("malformed");
        assert!(matches!(error, TransportError::Framing { .. }));
    }

    #[test]
    fn heads_are_bounded() {
        let mut raw = b"GET /status HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat_n(b"X-Filler: aaaaaaaaaaaaaaaa\r\n", 1024).flatten());
        let mut reader = BufReader::new(&raw[..]);
        let error = read_head(&mut reader).expect_err("too large");
        assert!(matches!(error, TransportError::Framing { .. }));
    }

    #[test]
    fn endless_lines_are_cut_off() {
        let mut head = BufReader::new(std::io::repeat(b'a'));
        assert!(matches!(read_head(&mut head), Err(TransportError::Framing { .. })));

        let mut size_line = BufReader::new(std::io::repeat(b'1'));
        assert!(matches!(read_chunk(&mut size_line), Err(TransportError::Framing { .. })));

        let mut trailers = BufReader::new((&b"0\r\n"[..]).chain(std::io::repeat(b'x')));
        assert!(matches!(read_chunk(&mut trailers), Err(TransportError::Framing { .. })));
    }

    #[test]
    fn a_stalled_chunk_abandons_the_response() {
        let (client, mut server) = UnixStream::pair().expect("socket pair");
        let mut connection = HttpClientConnection::new(client);
        connection
            .send(&Frame::Request(Request::status()))
            .expect("send");
        connection
            .set_receive_timeout(Some(Duration::from_millis(50)))
            .expect("timeout");
        server
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n40\r\n{\"kind\"")
            .expect("partial chunk");

        let error = connection.receive().expect_err("stalled");
        assert!(matches!(error, TransportError::Framing { .. }), "{error:?}");
        assert_eq!(connection.receive().expect("finished"), None);
    }

    #[test]
    fn non_success_status_is_reported_to_the_client() {
        let (client, mut server) = UnixStream::pair().expect("socket pair");
        let mut connection = HttpClientConnection::new(client);
        connection
            .send(&Frame::Request(Request::status()))
            .expect("send");
        server
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .expect("write");

        let error = connection.receive().expect_err("404");
        assert!(error.to_string().contains("404"));
    }
}
