//! Capture of adaptor output as [`LogRecord`]s.
//!
//! Callbacks and the subprocesses they supervise write through a
//! [`LogSink`]. While a request is in flight the sink is a queue drained by a
//! separate frame-emitting thread, so the callback can block for as long as
//! it likes while its output reaches the client live.

use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use adaptor_protocol::{LogRecord, OutputStream};
use tracing::{debug, info, warn};

use crate::cancel::lock;

pub(crate) const OUTPUT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::output");

/// Destination for captured output.
pub trait LogSink: Send + Sync {
    /// Accepts one record. Must not block on the consumer.
    fn emit(&self, record: LogRecord);
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn LogSink>;

/// Queue-backed sink.
///
/// [`ChannelSink::close`] detaches the queue even while clones of the sink
/// are still alive, so the consumer always observes the end of a request.
#[derive(Debug)]
pub struct ChannelSink {
    sender: Mutex<Option<Sender<LogRecord>>>,
}

impl ChannelSink {
    /// Creates the sink and the receiving end of its queue.
    #[must_use]
    pub fn new() -> (Arc<Self>, Receiver<LogRecord>) {
        let (sender, receiver) = mpsc::channel();
        (
            Arc::new(Self {
                sender: Mutex::new(Some(sender)),
            }),
            receiver,
        )
    }

    /// Ends the queue. Later records are dropped.
    pub fn close(&self) {
        lock(&self.sender).take();
    }
}

impl LogSink for ChannelSink {
    fn emit(&self, record: LogRecord) {
        let guard = lock(&self.sender);
        match guard.as_ref() {
            Some(sender) => {
                if sender.send(record).is_err() {
                    debug!(target: OUTPUT_TARGET, "output consumer gone; record dropped");
                }
            }
            None => debug!(target: OUTPUT_TARGET, "output emitted after request ended; dropped"),
        }
    }
}

/// Sink that writes into the diagnostic log. Used when no client is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, record: LogRecord) {
        let text = record.text.trim_end_matches(['\r', '\n']);
        match record.stream {
            OutputStream::Stdout => info!(target: OUTPUT_TARGET, stream = "stdout", "{text}"),
            OutputStream::Stderr => warn!(target: OUTPUT_TARGET, stream = "stderr", "{text}"),
        }
    }
}

/// [`Write`] adapter that turns complete lines into records.
///
/// Bytes after the last newline are held back until more arrive, the writer
/// is flushed, or it is dropped.
pub struct OutputWriter {
    sink: SharedSink,
    stream: OutputStream,
    pending: Vec<u8>,
}

impl OutputWriter {
    /// Creates a writer that emits to `stream`.
    #[must_use]
    pub fn new(sink: SharedSink, stream: OutputStream) -> Self {
        Self {
            sink,
            stream,
            pending: Vec::new(),
        }
    }

    fn emit_bytes(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(bytes).into_owned();
        self.sink.emit(LogRecord::new(self.stream, text));
    }
}

impl Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if let Some(last_newline) = self.pending.iter().rposition(|byte| *byte == b'\n') {
            let rest = self.pending.split_off(last_newline + 1);
            let complete = std::mem::replace(&mut self.pending, rest);
            self.emit_bytes(&complete);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let pending = std::mem::take(&mut self.pending);
        self.emit_bytes(&pending);
        Ok(())
    }
}

impl Drop for OutputWriter {
    fn drop(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.emit_bytes(&pending);
    }
}

/// Runs `callback` on a worker thread while forwarding everything it emits
/// to `stdout` and `stderr` on the calling thread.
///
/// Used by the foreground runner, where the console writers cannot be shared
/// across threads.
pub(crate) fn capture_into<T, F>(stdout: &mut dyn Write, stderr: &mut dyn Write, callback: F) -> T
where
    T: Send,
    F: FnOnce(&SharedSink) -> T + Send,
{
    let (channel, records) = ChannelSink::new();
    thread::scope(|scope| {
        let worker = scope.spawn(move || {
            let sink: SharedSink = channel.clone();
            let result = callback(&sink);
            channel.close();
            result
        });
        for record in records {
            let target: &mut dyn Write = match record.stream {
                OutputStream::Stdout => &mut *stdout,
                OutputStream::Stderr => &mut *stderr,
            };
            if let Err(error) = target
                .write_all(record.text.as_bytes())
                .and_then(|()| target.flush())
            {
                debug!(target: OUTPUT_TARGET, %error, "console write failed");
            }
        }
        match worker.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<LogRecord>>);

    impl LogSink for Collecting {
        fn emit(&self, record: LogRecord) {
            lock(&self.0).push(record);
        }
    }

    fn texts(sink: &Collecting) -> Vec<String> {
        lock(&sink.0).iter().map(|record| record.text.clone()).collect()
    }

    #[test]
    fn writer_emits_complete_lines_only() {
        let sink = Arc::new(Collecting::default());
        let mut writer = OutputWriter::new(sink.clone(), OutputStream::Stdout);
        write!(writer, "one\ntw").expect("write");
        assert_eq!(texts(&sink), vec!["one\n"]);
        writeln!(writer, "o").expect("write");
        assert_eq!(texts(&sink), vec!["one\n", "two\n"]);
    }

    #[test]
    fn writer_flushes_partial_line_on_drop() {
        let sink = Arc::new(Collecting::default());
        {
            let mut writer = OutputWriter::new(sink.clone(), OutputStream::Stderr);
            write!(writer, "no newline").expect("write");
        }
        let records = lock(&sink.0).clone();
        assert_eq!(records, vec![LogRecord::new(OutputStream::Stderr, "no newline")]);
    }

    #[test]
    fn closed_channel_sink_drops_records() {
        let (sink, records) = ChannelSink::new();
        sink.emit(LogRecord::new(OutputStream::Stdout, "kept\n"));
        sink.close();
        sink.emit(LogRecord::new(OutputStream::Stdout, "dropped\n"));
        let received: Vec<_> = records.iter().map(|record| record.text).collect();
        assert_eq!(received, vec!["kept\n"]);
    }

    #[test]
    fn capture_routes_streams_in_order() {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let value = capture_into(&mut stdout, &mut stderr, |sink| {
            sink.emit(LogRecord::new(OutputStream::Stdout, "a\n"));
            sink.emit(LogRecord::new(OutputStream::Stderr, "b\n"));
            sink.emit(LogRecord::new(OutputStream::Stdout, "c\n"));
            7
        });
        assert_eq!(value, 7);
        assert_eq!(stdout, b"a\nc\n");
        assert_eq!(stderr, b"b\n");
    }
}
