//! Binary entry point for the echo adaptor.
//!
//! Console handles are passed unlocked: the runtime writes diagnostics from
//! worker threads while output is being forwarded.

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    echo_adaptor::entry_point().run(std::env::args_os(), &mut io::stdout(), &mut io::stderr())
}
