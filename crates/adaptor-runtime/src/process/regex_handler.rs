use std::fmt;

use regex::{Captures, Regex};

type MatchFn = dyn Fn(&Captures<'_>) + Send + Sync;

/// Callback fired when any of its patterns matches an output line.
pub struct RegexCallback {
    patterns: Vec<Regex>,
    callback: Box<MatchFn>,
    exit_if_matched: bool,
    only_run_if_first_matched: bool,
}

impl RegexCallback {
    /// Fires `callback` with the captures of the first pattern that matches.
    pub fn new<F>(patterns: Vec<Regex>, callback: F) -> Self
    where
        F: Fn(&Captures<'_>) + Send + Sync + 'static,
    {
        Self {
            patterns,
            callback: Box::new(callback),
            exit_if_matched: false,
            only_run_if_first_matched: false,
        }
    }

    /// When this callback matches, later callbacks are skipped for the line.
    #[must_use]
    pub const fn exit_if_matched(mut self, enabled: bool) -> Self {
        self.exit_if_matched = enabled;
        self
    }

    /// Skip this callback when an earlier one already matched the line.
    #[must_use]
    pub const fn only_run_if_first_matched(mut self, enabled: bool) -> Self {
        self.only_run_if_first_matched = enabled;
        self
    }

    fn captures<'h>(&self, line: &'h str) -> Option<Captures<'h>> {
        self.patterns.iter().find_map(|pattern| pattern.captures(line))
    }
}

impl fmt::Debug for RegexCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegexCallback")
            .field("patterns", &self.patterns)
            .field("exit_if_matched", &self.exit_if_matched)
            .field("only_run_if_first_matched", &self.only_run_if_first_matched)
            .finish_non_exhaustive()
    }
}

/// Ordered set of [`RegexCallback`]s applied to each output line.
#[derive(Debug, Default)]
pub struct RegexHandler {
    callbacks: Vec<RegexCallback>,
}

impl RegexHandler {
    /// Evaluates `callbacks` in the given order.
    #[must_use]
    pub const fn new(callbacks: Vec<RegexCallback>) -> Self {
        Self { callbacks }
    }

    /// Runs the callbacks matching `line`. Returns whether any matched.
    pub fn handle_line(&self, line: &str) -> bool {
        let mut matched = false;
        for callback in &self.callbacks {
            if matched && callback.only_run_if_first_matched {
                continue;
            }
            let Some(captures) = callback.captures(line) else {
                continue;
            };
            (callback.callback)(&captures);
            matched = true;
            if callback.exit_if_matched {
                break;
            }
        }
        matched
    }
}
