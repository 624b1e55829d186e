//! Tests for argument handling and exit codes.

use std::ffi::OsString;
use std::fs;
use std::process::ExitCode;

use adaptor_protocol::{ConnectionInfo, TransportKind, exit_codes};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::EntryPoint;
use crate::adaptor::AdaptorFactory;
use crate::registry::write_connection_file;
use crate::test_support::ScriptedAdaptor;

struct Invocation {
    code: ExitCode,
    stdout: String,
    stderr: String,
}

#[fixture]
fn entry_point() -> EntryPoint {
    EntryPoint::new(
        "scripted",
        AdaptorFactory::new(|_init| Ok(ScriptedAdaptor::default())),
    )
}

fn invoke(entry: &EntryPoint, args: &[&str]) -> Invocation {
    let argv = std::iter::once("scripted")
        .chain(args.iter().copied())
        .map(OsString::from);
    let (mut out, mut err) = (Vec::new(), Vec::new());
    let code = entry.run(argv, &mut out, &mut err);
    Invocation {
        code,
        stdout: String::from_utf8(out).expect("utf8 stdout"),
        stderr: String::from_utf8(err).expect("utf8 stderr"),
    }
}

#[rstest]
fn help_goes_to_stdout_and_succeeds(entry_point: EntryPoint) {
    let result = invoke(&entry_point, &["--help"]);
    assert_eq!(result.code, ExitCode::SUCCESS);
    assert!(result.stdout.contains("daemon"));
    assert!(!result.stdout.contains("_serve"));
}

#[rstest]
#[case::unknown_command(&["render"])]
#[case::missing_connection_file(&["daemon", "run"])]
#[case::bad_run_data(&["run", "--run-data", "[1]"])]
#[case::bad_transport(&["--transport", "carrier-pigeon", "run"])]
#[case::bad_path_mapping(&["run", "--path-mapping-rules", r#"{"path_mapping_rules": [{}]}"#])]
fn usage_errors_exit_with_usage(entry_point: EntryPoint, #[case] args: &[&str]) {
    let result = invoke(&entry_point, args);
    assert_eq!(result.code, ExitCode::from(exit_codes::USAGE));
    assert!(!result.stderr.is_empty());
}

#[rstest]
fn foreground_run_writes_adaptor_output(entry_point: EntryPoint) {
    let result = invoke(&entry_point, &["run", "--run-data", r#"{"echo": "frame 1"}"#]);
    assert_eq!(result.code, ExitCode::SUCCESS);
    assert!(result.stdout.contains("starting\n"));
    assert!(result.stdout.contains("\"frame 1\"\n"));
}

#[rstest]
fn foreground_run_applies_path_mapping_rules(entry_point: EntryPoint) {
    let rules = r#"{"path_mapping_rules": [{"source_path_format": "linux",
        "source_path": "/render/in", "destination_os": "linux", "destination_path": "/scratch"}]}"#;
    let result = invoke(
        &entry_point,
        &["run", "--path-mapping-rules", rules, "--run-data", r#"{"map": "/render/in/a.exr"}"#],
    );
    assert_eq!(result.code, ExitCode::SUCCESS);
    assert!(result.stdout.contains("/scratch/a.exr\n"));
}

#[rstest]
fn foreground_failures_exit_with_callback_failed(entry_point: EntryPoint) {
    let result = invoke(&entry_point, &["run", "--run-data", r#"{"fail": true}"#]);
    assert_eq!(result.code, ExitCode::from(exit_codes::CALLBACK_FAILED));
    assert!(result.stderr.contains("openjd_fail: boom"));
}

#[rstest]
fn status_without_connection_file_is_not_found(entry_point: EntryPoint) {
    let dir = TempDir::new().expect("temp dir");
    let file = dir.path().join("missing.json");
    let path = file.to_str().expect("utf8 path");
    let result = invoke(&entry_point, &["daemon", "status", "--connection-file", path]);
    assert_eq!(result.code, ExitCode::from(exit_codes::CONNECTION_FILE_NOT_FOUND));
}

#[rstest]
fn corrupt_connection_file_is_reported(entry_point: EntryPoint) {
    let dir = TempDir::new().expect("temp dir");
    let file = dir.path().join("conn.json");
    fs::write(&file, "{\"transport\":").expect("write");
    let path = file.to_str().expect("utf8 path");
    let result = invoke(&entry_point, &["daemon", "run", "--connection-file", path]);
    assert_eq!(result.code, ExitCode::from(exit_codes::CONNECTION_FILE_CORRUPT));
}

#[cfg(unix)]
#[rstest]
fn stopping_a_dead_daemon_clears_its_file(entry_point: EntryPoint) {
    let dir = TempDir::new().expect("temp dir");
    let file = dir.path().join("conn.json");
    let socket = dir.path().join("gone.sock");
    let info = ConnectionInfo::new(
        TransportKind::Socket,
        socket.to_str().expect("utf8 path"),
        4_000_000,
        0,
    );
    write_connection_file(&file, &info).expect("write connection file");
    let path = file.to_str().expect("utf8 path");

    let result = invoke(&entry_point, &["daemon", "stop", "--connection-file", path]);

    assert_eq!(result.code, ExitCode::SUCCESS);
    assert!(result.stderr.contains("no daemon is running"));
    assert!(!file.exists());
}

#[cfg(unix)]
#[rstest]
fn running_against_a_dead_daemon_is_refused(entry_point: EntryPoint) {
    let dir = TempDir::new().expect("temp dir");
    let file = dir.path().join("conn.json");
    let info = ConnectionInfo::new(
        TransportKind::Pipe,
        dir.path().join("gone.sock").to_str().expect("utf8 path"),
        4_000_000,
        0,
    );
    write_connection_file(&file, &info).expect("write connection file");
    let path = file.to_str().expect("utf8 path");

    let result = invoke(&entry_point, &["daemon", "run", "--connection-file", path]);

    assert_eq!(result.code, ExitCode::from(exit_codes::CONNECTION_REFUSED));
}
