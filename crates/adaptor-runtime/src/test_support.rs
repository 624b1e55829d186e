//! Adaptors and sinks shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use adaptor_protocol::{LogRecord, OutputStream, Payload};

use crate::adaptor::{Adaptor, AdaptorError, CallbackContext};
use crate::cancel::lock;
use crate::output::{LogSink, SharedSink};

/// Sink that keeps every record.
#[derive(Debug, Default)]
pub(crate) struct CollectingSink {
    records: Mutex<Vec<LogRecord>>,
}

impl CollectingSink {
    pub(crate) fn shared() -> (Arc<Self>, SharedSink) {
        let sink = Arc::new(Self::default());
        let shared: SharedSink = sink.clone();
        (sink, shared)
    }

    pub(crate) fn records(&self) -> Vec<LogRecord> {
        lock(&self.records).clone()
    }

    pub(crate) fn text(&self, stream: OutputStream) -> String {
        self.records()
            .into_iter()
            .filter(|record| record.stream == stream)
            .map(|record| record.text)
            .collect()
    }
}

impl LogSink for CollectingSink {
    fn emit(&self, record: LogRecord) {
        lock(&self.records).push(record);
    }
}

/// Names of the callbacks invoked, in order.
pub(crate) type CallLog = Arc<Mutex<Vec<String>>>;

/// Adaptor driven by directives in its run data.
///
/// - `fail`: the run returns an error
/// - `cancel`: the run cancels its own token, as a signal would
/// - `wait`: the run blocks until canceled, up to five seconds
/// - `pause`: the run lingers briefly, widening any overlap window
/// - `echo`: the run prints the value
/// - `map`: the run prints the path after path mapping
#[derive(Debug, Default)]
pub(crate) struct ScriptedAdaptor {
    pub(crate) calls: CallLog,
    pub(crate) fail_start: bool,
    pub(crate) fail_stop: bool,
    pub(crate) active: Arc<AtomicUsize>,
    pub(crate) overlapped: Arc<AtomicUsize>,
}

impl ScriptedAdaptor {
    pub(crate) fn new() -> (Self, CallLog) {
        let adaptor = Self::default();
        let calls = Arc::clone(&adaptor.calls);
        (adaptor, calls)
    }

    fn record(&self, call: &str) {
        lock(&self.calls).push(call.to_owned());
    }
}

impl Adaptor for ScriptedAdaptor {
    fn on_start(&mut self, ctx: &CallbackContext) -> Result<(), AdaptorError> {
        self.record("start");
        ctx.emit(OutputStream::Stdout, "starting\n");
        if self.fail_start {
            return Err(AdaptorError::msg("cannot load application"));
        }
        Ok(())
    }

    fn on_run(&mut self, run_data: &Payload, ctx: &CallbackContext) -> Result<(), AdaptorError> {
        self.record("run");
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.fetch_add(1, Ordering::SeqCst);
        }
        let outcome = (|| {
            if let Some(value) = run_data.get("echo") {
                ctx.emit(OutputStream::Stdout, format!("{value}\n"));
            }
            if let Some(path) = run_data.get("map").and_then(serde_json::Value::as_str) {
                ctx.emit(OutputStream::Stdout, format!("{}\n", ctx.map_path(path)));
            }
            if run_data.contains_key("pause") {
                std::thread::sleep(Duration::from_millis(30));
            }
            if run_data.contains_key("cancel") {
                ctx.cancellation().cancel();
            }
            if run_data.contains_key("wait") && !ctx.cancellation().wait_timeout(Duration::from_secs(5)) {
                return Err(AdaptorError::msg("wait was never canceled"));
            }
            if run_data.contains_key("fail") {
                return Err(AdaptorError::msg("boom"));
            }
            Ok(())
        })();
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn on_stop(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
        self.record("stop");
        if self.fail_stop {
            return Err(AdaptorError::msg("stop failed"));
        }
        Ok(())
    }

    fn on_cleanup(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
        self.record("cleanup");
        Ok(())
    }

    fn on_cancel(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
        self.record("cancel");
        Ok(())
    }
}

/// Builds a run payload with one directive.
pub(crate) fn directive(key: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert(key.to_owned(), serde_json::Value::Bool(true));
    payload
}

pub(crate) fn calls(log: &CallLog) -> Vec<String> {
    lock(log).clone()
}
