//! An adaptor that echoes its run data.
//!
//! It wraps no real application. Each run prints one line per data entry,
//! and a handful of underscore-prefixed directives make it fail, sleep,
//! write to stderr, map a path or launch a subprocess, which is enough to drive every
//! path through the runtime from a test.
//!
//! Init data:
//!
//! - `name`: prefix for echoed lines, `echo` by default
//! - `fail_start`: make `on_start` fail
//! - `marker_dir`: directory where every callback appends its name to
//!   `callbacks.log`

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use adaptor_runtime::{
    Adaptor, AdaptorError, AdaptorFactory, CallbackContext, EntryPoint, Payload,
};
use serde_json::Value;
use tracing::debug;

/// Name the adaptor registers under.
pub const ADAPTOR_NAME: &str = "echo";

/// File inside `marker_dir` that records callbacks.
pub const CALLBACK_LOG: &str = "callbacks.log";

const ECHO_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::adaptor");

/// The echo adaptor.
#[derive(Debug)]
pub struct EchoAdaptor {
    name: String,
    fail_start: bool,
    marker_dir: Option<PathBuf>,
}

impl EchoAdaptor {
    /// Builds the adaptor from init data.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::InvalidData`] when a field has the wrong type.
    pub fn from_init_data(init_data: &Payload) -> Result<Self, AdaptorError> {
        let name = match init_data.get("name") {
            None => ADAPTOR_NAME.to_owned(),
            Some(Value::String(name)) => name.clone(),
            Some(other) => return Err(AdaptorError::InvalidData(format!("name must be a string, got {other}"))),
        };
        let fail_start = match init_data.get("fail_start") {
            None => false,
            Some(Value::Bool(flag)) => *flag,
            Some(other) => {
                return Err(AdaptorError::InvalidData(format!("fail_start must be a boolean, got {other}")));
            }
        };
        let marker_dir = match init_data.get("marker_dir") {
            None => None,
            Some(Value::String(dir)) => Some(PathBuf::from(dir)),
            Some(other) => {
                return Err(AdaptorError::InvalidData(format!("marker_dir must be a string, got {other}")));
            }
        };
        Ok(Self {
            name,
            fail_start,
            marker_dir,
        })
    }

    fn mark(&self, callback: &str) -> Result<(), AdaptorError> {
        let Some(dir) = &self.marker_dir else {
            return Ok(());
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(CALLBACK_LOG))?;
        writeln!(file, "{callback}")?;
        Ok(())
    }
}

impl Adaptor for EchoAdaptor {
    fn on_start(&mut self, ctx: &CallbackContext) -> Result<(), AdaptorError> {
        self.mark("start")?;
        if self.fail_start {
            return Err(AdaptorError::msg(format!("{} refused to start", self.name)));
        }
        writeln!(ctx.stdout(), "{} ready", self.name)?;
        Ok(())
    }

    fn on_run(&mut self, run_data: &Payload, ctx: &CallbackContext) -> Result<(), AdaptorError> {
        self.mark("run")?;
        let mut stdout = ctx.stdout();
        for (key, value) in run_data.iter().filter(|(key, _)| !key.starts_with('_')) {
            writeln!(stdout, "{}: {key} {value}", self.name)?;
        }
        if let Some(path) = run_data.get("_map_path").and_then(Value::as_str) {
            writeln!(stdout, "{}: mapped {}", self.name, ctx.map_path(path))?;
        }
        stdout.flush()?;
        if let Some(text) = run_data.get("_stderr").and_then(Value::as_str) {
            writeln!(ctx.stderr(), "{text}")?;
        }
        if let Some(percent) = run_data.get("_progress").and_then(Value::as_f64) {
            #[expect(clippy::cast_possible_truncation, reason = "progress is a percentage")]
            ctx.update_progress(percent as f32);
        }
        if let Some(command) = run_data.get("_command") {
            run_command(command, ctx)?;
        }
        if let Some(millis) = run_data.get("_sleep_ms").and_then(Value::as_u64) {
            debug!(target: ECHO_TARGET, millis, "sleeping");
            if ctx.cancellation().wait_timeout(Duration::from_millis(millis)) {
                return Err(AdaptorError::Canceled);
            }
        }
        if let Some(reason) = run_data.get("_fail") {
            let text = reason.as_str().map_or_else(|| reason.to_string(), str::to_owned);
            return Err(AdaptorError::Failed(text));
        }
        Ok(())
    }

    fn on_stop(&mut self, ctx: &CallbackContext) -> Result<(), AdaptorError> {
        self.mark("stop")?;
        writeln!(ctx.stdout(), "{} stopping", self.name)?;
        Ok(())
    }

    fn on_cleanup(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
        self.mark("cleanup")
    }

    fn on_cancel(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
        self.mark("cancel")
    }
}

fn run_command(command: &Value, ctx: &CallbackContext) -> Result<(), AdaptorError> {
    let parts: Vec<&str> = command
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let Some((program, args)) = parts.split_first() else {
        return Err(AdaptorError::InvalidData(
            "_command must be a non-empty array of strings".to_owned(),
        ));
    };
    ctx.managed_process(program).args(args).run_checked()
}

/// Command-line entry point of the echo adaptor.
#[must_use]
pub fn entry_point() -> EntryPoint {
    EntryPoint::new(
        ADAPTOR_NAME,
        AdaptorFactory::new(|init_data| EchoAdaptor::from_init_data(&init_data)),
    )
}
