//! Adaptors whose only job is to run one command per unit of work.

use std::fmt;

use adaptor_protocol::Payload;
use tracing::debug;

use crate::adaptor::{Adaptor, AdaptorError, CallbackContext};
use crate::process::ManagedProcess;

const COMMAND_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::command");

/// An adaptor described by the command each run launches.
///
/// Wrap an implementation in [`CommandRunner`] to obtain an [`Adaptor`].
/// Start, stop and cleanup do nothing; a run calls [`Self::on_prerun`],
/// runs the command to completion and then calls [`Self::on_postrun`].
/// Cancellation terminates the command.
pub trait CommandAdaptor: Send {
    /// Builds the command for one run.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptorError::InvalidData`] when `run_data` does not
    /// describe a command.
    fn managed_process(&mut self, run_data: &Payload, ctx: &CallbackContext) -> Result<ManagedProcess, AdaptorError>;

    /// Called before the command is launched.
    fn on_prerun(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
        Ok(())
    }

    /// Called after the command exited successfully.
    fn on_postrun(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
        Ok(())
    }
}

/// Runs a [`CommandAdaptor`] as an [`Adaptor`].
pub struct CommandRunner<C> {
    inner: C,
}

impl<C: CommandAdaptor> CommandRunner<C> {
    /// Wraps `inner`.
    #[must_use]
    pub const fn new(inner: C) -> Self {
        Self { inner }
    }

    /// The wrapped command adaptor.
    #[must_use]
    pub const fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C> fmt::Debug for CommandRunner<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRunner").finish_non_exhaustive()
    }
}

impl<C: CommandAdaptor> Adaptor for CommandRunner<C> {
    fn on_run(&mut self, run_data: &Payload, ctx: &CallbackContext) -> Result<(), AdaptorError> {
        let process = self.inner.managed_process(run_data, ctx)?;
        self.inner.on_prerun(ctx)?;
        debug!(target: COMMAND_TARGET, "launching run command");
        process.run_checked()?;
        self.inner.on_postrun(ctx)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::test_support::CollectingSink;
    use adaptor_protocol::OutputStream;
    use serde_json::{Value, json};

    /// Runs `sh -c <script>` and records the hooks it passes through.
    #[derive(Default)]
    struct Shell {
        hooks: Vec<&'static str>,
    }

    impl CommandAdaptor for Shell {
        fn managed_process(&mut self, run_data: &Payload, ctx: &CallbackContext) -> Result<ManagedProcess, AdaptorError> {
            let script = run_data
                .get("script")
                .and_then(Value::as_str)
                .ok_or_else(|| AdaptorError::InvalidData("script is required".to_owned()))?;
            Ok(ctx.managed_process("sh").arg("-c").arg(script))
        }

        fn on_prerun(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
            self.hooks.push("prerun");
            Ok(())
        }

        fn on_postrun(&mut self, _ctx: &CallbackContext) -> Result<(), AdaptorError> {
            self.hooks.push("postrun");
            Ok(())
        }
    }

    fn run_data(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[test]
    fn run_launches_the_command_between_the_hooks() {
        let (sink, shared) = CollectingSink::shared();
        let ctx = CallbackContext::new(shared, CancellationToken::default());
        let mut runner = CommandRunner::new(Shell::default());

        runner
            .on_run(&run_data(json!({"script": "echo rendered"})), &ctx)
            .expect("run");

        assert_eq!(sink.text(OutputStream::Stdout), "rendered\n");
        assert_eq!(runner.inner().hooks, vec!["prerun", "postrun"]);
    }

    #[test]
    fn a_failing_command_skips_postrun() {
        let (_sink, shared) = CollectingSink::shared();
        let ctx = CallbackContext::new(shared, CancellationToken::default());
        let mut runner = CommandRunner::new(Shell::default());

        let error = runner
            .on_run(&run_data(json!({"script": "exit 3"})), &ctx)
            .expect_err("command fails");

        assert!(matches!(error, AdaptorError::ProcessFailed { .. }));
        assert_eq!(runner.inner().hooks, vec!["prerun"]);
    }

    #[test]
    fn run_data_without_a_command_is_rejected_before_prerun() {
        let (_sink, shared) = CollectingSink::shared();
        let ctx = CallbackContext::new(shared, CancellationToken::default());
        let mut runner = CommandRunner::new(Shell::default());

        let error = runner.on_run(&Payload::new(), &ctx).expect_err("no script");

        assert!(matches!(error, AdaptorError::InvalidData(_)));
        assert!(runner.inner().hooks.is_empty());
    }

    #[test]
    fn other_callbacks_do_nothing() {
        let (sink, shared) = CollectingSink::shared();
        let ctx = CallbackContext::new(shared, CancellationToken::default());
        let mut runner = CommandRunner::new(Shell::default());

        runner.on_start(&ctx).expect("start");
        runner.on_stop(&ctx).expect("stop");
        runner.on_cleanup(&ctx).expect("cleanup");

        assert!(sink.records().is_empty());
    }
}
