//! Signal delivery runs in its own test binary so no other test's handlers
//! see the raised signal.
#![cfg(unix)]

use std::sync::mpsc;
use std::time::Duration;

use adaptor_runtime::SignalBridge;
use nix::sys::signal::{Signal, raise};

#[test]
fn delivered_signals_reach_the_handler() {
    let (sender, received) = mpsc::channel();
    let bridge = SignalBridge::install(move |signal| {
        sender.send(signal).expect("send signal number");
    })
    .expect("install bridge");

    raise(Signal::SIGHUP).expect("raise SIGHUP");

    let signal = received
        .recv_timeout(Duration::from_secs(5))
        .expect("signal forwarded");
    assert_eq!(signal, Signal::SIGHUP as i32);
    drop(bridge);
}
