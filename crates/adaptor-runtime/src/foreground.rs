//! Runs a whole adaptor lifecycle in the current process.

use std::io::Write;

use adaptor_config::Config;
use adaptor_protocol::{PathMapping, Payload, exit_codes};
use tracing::info;

use crate::adaptor::AdaptorFactory;
use crate::cancel::CancellationToken;
use crate::lifecycle::Lifecycle;
use crate::output::capture_into;
use crate::supervisor::{ProcessError, SignalBridge};

const FOREGROUND_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::foreground");

/// Starts the adaptor, performs one run and tears it down, writing output
/// straight to `stdout` and `stderr`.
///
/// Interrupt and terminate signals cancel the lifecycle; the adaptor still
/// gets `on_cancel`, `on_stop` and `on_cleanup`.
///
/// Returns the exit code: success, callback failure or canceled.
///
/// # Errors
///
/// Returns [`ProcessError::Signal`] when signal handlers cannot be
/// installed.
pub fn run_foreground(
    factory: &AdaptorFactory,
    init_data: Payload,
    path_mapping: PathMapping,
    run_data: &Payload,
    config: &Config,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<u8, ProcessError> {
    let token = CancellationToken::new(config.terminate_grace);
    let _bridge = {
        let token = token.clone();
        SignalBridge::install(move |_signal| token.cancel())?
    };
    Ok(drive(factory, init_data, path_mapping, run_data, &token, stdout, stderr))
}

fn drive(
    factory: &AdaptorFactory,
    init_data: Payload,
    path_mapping: PathMapping,
    run_data: &Payload,
    token: &CancellationToken,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> u8 {
    let outcome = capture_into(stdout, stderr, |sink| {
        let mut lifecycle =
            Lifecycle::new(factory.create(init_data), token.clone()).with_path_mapping(path_mapping);
        let work = lifecycle
            .start(sink)
            .and_then(|()| lifecycle.run(run_data, sink));
        let teardown = lifecycle.teardown(sink);
        work.and(teardown)
    });
    let code = match &outcome {
        _ if token.is_cancelled() => exit_codes::CANCELED,
        Ok(()) => exit_codes::SUCCESS,
        Err(error) => error.exit_code(),
    };
    info!(target: FOREGROUND_TARGET, code, "foreground run finished");
    code
}
