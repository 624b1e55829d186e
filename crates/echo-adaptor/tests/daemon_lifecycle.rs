//! End-to-end tests driving the `echo-adaptor` binary through foreground
//! runs and the background daemon, over both transports. The scenarios in
//! `features/daemon_lifecycle.feature` share the harness defined here.
#![cfg(unix)]

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command as StdCommand, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use predicates::prelude::*;
use predicates::str::contains;
use rstest::{fixture, rstest};
use rstest_bdd_macros::{given, scenario, then, when};
use serde_json::{Value, json};
use tempfile::TempDir;

const CONNECTION_REFUSED: i32 = 69;
const STARTUP_FAILED: i32 = 70;
const CANCELED: i32 = 3;
const PATIENCE: Duration = Duration::from_secs(10);

struct Harness {
    dir: TempDir,
}

impl Harness {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn connection_file(&self) -> PathBuf {
        self.path("connection.json")
    }

    fn init_data(&self, extra: &Value) -> String {
        let mut init = json!({ "marker_dir": self.dir.path() });
        if let (Some(target), Some(source)) = (init.as_object_mut(), extra.as_object()) {
            target.extend(source.clone());
        }
        init.to_string()
    }

    fn env(&self, transport: &str) -> Vec<(&'static str, String)> {
        vec![
            ("ADAPTOR_RUNTIME_TRANSPORT", transport.to_owned()),
            (
                "ADAPTOR_RUNTIME_SOCKET_DIR",
                self.path("sockets").display().to_string(),
            ),
            ("ADAPTOR_RUNTIME_STARTUP_TIMEOUT_MS", "10000".to_owned()),
            ("ADAPTOR_RUNTIME_REAP_TIMEOUT_MS", "3000".to_owned()),
            ("ADAPTOR_RUNTIME_STARTUP_LINGER_MS", "3000".to_owned()),
            ("ADAPTOR_RUNTIME_LOG_FILTER", "debug".to_owned()),
        ]
    }

    fn command(&self, transport: &str, args: &[&str]) -> Command {
        let mut command = cargo_bin_cmd!("echo-adaptor");
        command
            .env_remove("ADAPTOR_RUNTIME_FOREGROUND")
            .envs(self.env(transport))
            .args(args)
            .timeout(Duration::from_secs(60));
        command
    }

    fn daemon(&self, transport: &str, action: &str, data_flag: Option<(&str, &str)>) -> Command {
        let file = self.connection_file();
        let mut args = vec!["daemon", action, "--connection-file", file.to_str().expect("utf8 path")];
        if let Some((flag, value)) = data_flag {
            args.extend([flag, value]);
        }
        self.command(transport, &args)
    }

    fn start(&self, transport: &str, extra: &Value) -> Command {
        let init = self.init_data(extra);
        self.daemon(transport, "start", Some(("--init-data", &init)))
    }

    fn run(&self, transport: &str, run_data: &Value) -> Command {
        let data = run_data.to_string();
        self.daemon(transport, "run", Some(("--run-data", &data)))
    }

    fn spawn_daemon_command(&self, transport: &str, action: &str, data_flag: (&str, String)) -> Child {
        StdCommand::new(env!("CARGO_BIN_EXE_echo-adaptor"))
            .env_remove("ADAPTOR_RUNTIME_FOREGROUND")
            .envs(self.env(transport))
            .args(["daemon", action, "--connection-file"])
            .arg(self.connection_file())
            .arg(data_flag.0)
            .arg(data_flag.1)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn daemon command")
    }

    fn spawn_run(&self, transport: &str, run_data: &Value) -> Child {
        self.spawn_daemon_command(transport, "run", ("--run-data", run_data.to_string()))
    }

    fn spawn_start(&self, transport: &str) -> Child {
        self.spawn_daemon_command(transport, "start", ("--init-data", self.init_data(&json!({}))))
    }

    fn callbacks(&self) -> Vec<String> {
        fs::read_to_string(self.path(echo_adaptor::CALLBACK_LOG))
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    fn daemon_pid(&self) -> i32 {
        let text = fs::read_to_string(self.connection_file()).expect("read connection file");
        let info: Value = serde_json::from_str(&text).expect("parse connection file");
        let pid = info["pid"].as_i64().expect("pid field");
        i32::try_from(pid).expect("pid fits")
    }
}

#[fixture]
fn harness() -> Harness {
    Harness {
        dir: TempDir::new().expect("temp dir"),
    }
}

fn wait_for(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {description}");
        thread::sleep(Duration::from_millis(50));
    }
}

fn gone(path: &Path) -> bool {
    !path.exists()
}

#[rstest]
#[case::framed("pipe")]
#[case::http("socket")]
fn start_run_stop_round_trip(harness: Harness, #[case] transport: &str) {
    harness.start(transport, &json!({})).assert().success();
    assert!(harness.connection_file().exists());
    let copy = harness.path("copy.json");
    fs::copy(harness.connection_file(), &copy).expect("copy connection file");

    harness
        .daemon(transport, "status", None)
        .assert()
        .success()
        .stdout(contains("ready"));
    harness
        .run(
            transport,
            &json!({"frame": 1, "scene": "a", "_progress": 50, "_stderr": "low on memory"}),
        )
        .assert()
        .success()
        .stdout("echo: frame 1\necho: scene \"a\"\nopenjd_progress: 50.0\n")
        .stderr(contains("low on memory"));
    harness
        .daemon(transport, "stop", None)
        .assert()
        .success()
        .stdout("echo stopping\n");

    assert!(gone(&harness.connection_file()));
    assert_eq!(harness.callbacks(), ["start", "run", "stop", "cleanup"]);
    harness
        .command(transport, &["daemon", "run", "--connection-file", copy.to_str().expect("utf8 path")])
        .assert()
        .code(CONNECTION_REFUSED);
}

#[rstest]
#[case::framed("pipe")]
#[case::http("socket")]
fn failed_runs_leave_the_daemon_ready(harness: Harness, #[case] transport: &str) {
    harness.start(transport, &json!({})).assert().success();

    harness
        .run(transport, &json!({"_fail": "bad frame"}))
        .assert()
        .code(1)
        .stderr(contains("openjd_fail: bad frame"));
    harness
        .run(transport, &json!({"frame": 2}))
        .assert()
        .success()
        .stdout(contains("echo: frame 2"));
    harness.daemon(transport, "stop", None).assert().success();

    assert_eq!(harness.callbacks(), ["start", "run", "run", "stop", "cleanup"]);
}

#[rstest]
#[case::framed("pipe")]
#[case::http("socket")]
fn run_data_can_come_from_a_file(harness: Harness, #[case] transport: &str) {
    harness.start(transport, &json!({})).assert().success();
    let data = harness.path("run.json");
    fs::write(&data, r#"{"scene": "shot_010"}"#).expect("write run data");
    let flag = format!("file://{}", data.display());

    harness
        .daemon(transport, "run", Some(("--run-data", &flag)))
        .assert()
        .success()
        .stdout(contains("echo: scene \"shot_010\""));
    harness.daemon(transport, "stop", None).assert().success();
}

#[rstest]
#[case::framed("pipe")]
#[case::http("socket")]
fn a_failed_start_is_reported_and_torn_down(harness: Harness, #[case] transport: &str) {
    harness
        .start(transport, &json!({"fail_start": true}))
        .assert()
        .code(STARTUP_FAILED)
        .stderr(contains("refused to start"));

    wait_for("the connection file to be removed", || gone(&harness.connection_file()));
    wait_for("cleanup to run", || harness.callbacks().contains(&"cleanup".to_owned()));
    assert_eq!(harness.callbacks(), ["start", "stop", "cleanup"]);
}

#[rstest]
#[case::framed("pipe")]
#[case::http("socket")]
fn daemons_map_paths_with_the_rules_they_started_with(harness: Harness, #[case] transport: &str) {
    let init = harness.init_data(&json!({}));
    let rules = json!({"path_mapping_rules": [{
        "source_path_format": "windows",
        "source_path": "S:\\shows",
        "destination_os": "linux",
        "destination_path": "/mnt/shows",
    }]})
    .to_string();
    let file = harness.connection_file();
    harness
        .command(
            transport,
            &[
                "daemon",
                "start",
                "--connection-file",
                file.to_str().expect("utf8 path"),
                "--init-data",
                &init,
                "--path-mapping-rules",
                &rules,
            ],
        )
        .assert()
        .success();

    harness
        .run(transport, &json!({"_map_path": "s:/Shows/ep1/shot.exr"}))
        .assert()
        .success()
        .stdout("echo: mapped /mnt/shows/ep1/shot.exr\n");
    harness.daemon(transport, "stop", None).assert().success();
}

#[rstest]
#[case::framed("pipe")]
#[case::http("socket")]
fn interrupting_a_run_cancels_the_daemon(harness: Harness, #[case] transport: &str) {
    harness.start(transport, &json!({})).assert().success();
    let client = harness.spawn_run(transport, &json!({"_sleep_ms": 30_000}));
    wait_for("the run to begin", || harness.callbacks().contains(&"run".to_owned()));

    let client_pid = i32::try_from(client.id()).expect("pid fits");
    kill(Pid::from_raw(client_pid), Signal::SIGTERM).expect("signal client");
    let output = client.wait_with_output().expect("client exits");

    assert_eq!(output.status.code(), Some(CANCELED));
    wait_for("the daemon to tear down", || gone(&harness.connection_file()));
    wait_for("cleanup to run", || harness.callbacks().contains(&"cleanup".to_owned()));
    assert_eq!(harness.callbacks(), ["start", "run", "cancel", "stop", "cleanup"]);
}

#[rstest]
#[case::framed("pipe")]
#[case::http("socket")]
fn stop_waits_for_the_run_in_flight(harness: Harness, #[case] transport: &str) {
    harness.start(transport, &json!({})).assert().success();
    let client = harness.spawn_run(transport, &json!({"frame": 4, "_sleep_ms": 1_000}));
    wait_for("the run to begin", || harness.callbacks().contains(&"run".to_owned()));

    harness.daemon(transport, "stop", None).assert().success();
    let output = client.wait_with_output().expect("client exits");

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("echo: frame 4"));
    assert_eq!(harness.callbacks(), ["start", "run", "stop", "cleanup"]);
}

#[rstest]
fn foreground_runs_the_whole_lifecycle(harness: Harness) {
    let init = harness.init_data(&json!({"name": "fg"}));
    harness
        .command(
            "pipe",
            &["run", "--init-data", &init, "--run-data", r#"{"frame": 5}"#],
        )
        .assert()
        .success()
        .stdout(contains("fg ready").and(contains("fg: frame 5")).and(contains("fg stopping")));
    assert_eq!(harness.callbacks(), ["start", "run", "stop", "cleanup"]);
}

#[rstest]
fn foreground_failures_exit_with_callback_failed(harness: Harness) {
    harness
        .command("pipe", &["run", "--run-data", r#"{"_fail": "no licence"}"#])
        .assert()
        .code(1)
        .stderr(contains("openjd_fail: no licence"));
}

/// State shared by the steps of one daemon lifecycle scenario.
struct World {
    harness: Harness,
    transport: String,
    output: Option<Output>,
    start_codes: Vec<Option<i32>>,
}

impl World {
    fn output(&self) -> &Output {
        self.output.as_ref().expect("a command ran")
    }
}

impl Drop for World {
    fn drop(&mut self) {
        if self.harness.connection_file().exists() {
            drop(self.harness.daemon(&self.transport, "stop", None).output());
        }
    }
}

#[fixture]
fn world() -> RefCell<World> {
    RefCell::new(World {
        harness: harness(),
        transport: String::new(),
        output: None,
        start_codes: Vec::new(),
    })
}

/// Turns the `\n` and `\"` escapes written in feature files into text.
fn unescape(text: &str) -> String {
    text.replace("\\n", "\n").replace("\\\"", "\"")
}

#[given("no daemon on the \"{transport}\" transport")]
fn given_no_daemon(world: &RefCell<World>, transport: String) {
    world.borrow_mut().transport = transport;
}

#[given("a daemon on the \"{transport}\" transport")]
fn given_a_daemon(world: &RefCell<World>, transport: String) {
    let mut world = world.borrow_mut();
    world.harness.start(&transport, &json!({})).assert().success();
    world.transport = transport;
}

#[when("a run echoes frame \"{frame}\" and scene \"{scene}\" at \"{percent}\" percent")]
fn when_run_echoes(world: &RefCell<World>, frame: String, scene: String, percent: String) {
    let mut world = world.borrow_mut();
    let frame: u64 = frame.parse().expect("numeric frame");
    let percent: u64 = percent.parse().expect("numeric percent");
    let run_data = json!({"frame": frame, "scene": scene, "_progress": percent});
    let output = world.harness.run(&world.transport, &run_data).output().expect("daemon run");
    world.output = Some(output);
}

#[when("the daemon is stopped")]
fn when_stopped(world: &RefCell<World>) {
    let mut world = world.borrow_mut();
    let output = world.harness.daemon(&world.transport, "stop", None).output().expect("daemon stop");
    world.output = Some(output);
}

#[when("another daemon is started for the same connection file")]
fn when_started_again(world: &RefCell<World>) {
    let mut world = world.borrow_mut();
    let output = world.harness.start(&world.transport, &json!({})).output().expect("daemon start");
    world.output = Some(output);
}

#[when("two daemons are started at once")]
fn when_started_concurrently(world: &RefCell<World>) {
    let mut world = world.borrow_mut();
    let starters = [
        world.harness.spawn_start(&world.transport),
        world.harness.spawn_start(&world.transport),
    ];
    world.start_codes = starters
        .into_iter()
        .map(|starter| starter.wait_with_output().expect("start exits").status.code())
        .collect();
}

#[when("the daemon receives SIGTERM")]
fn when_terminated(world: &RefCell<World>) {
    let pid = world.borrow().harness.daemon_pid();
    kill(Pid::from_raw(pid), Signal::SIGTERM).expect("signal daemon");
}

#[when("the daemon receives SIGKILL")]
fn when_killed(world: &RefCell<World>) {
    let pid = world.borrow().harness.daemon_pid();
    kill(Pid::from_raw(pid), Signal::SIGKILL).expect("kill daemon");
}

#[then("the command succeeds with stdout \"{stdout}\"")]
fn then_succeeds_with(world: &RefCell<World>, stdout: String) {
    let world = world.borrow();
    let output = world.output();
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout), unescape(&stdout));
}

#[then("the command exits with code \"{code}\"")]
fn then_exits_with(world: &RefCell<World>, code: String) {
    let expected: i32 = code.parse().expect("numeric exit code");
    assert_eq!(world.borrow().output().status.code(), Some(expected));
}

#[then("stderr mentions \"{text}\"")]
fn then_stderr_mentions(world: &RefCell<World>, text: String) {
    let world = world.borrow();
    let stderr = String::from_utf8_lossy(&world.output().stderr);
    assert!(stderr.contains(&text), "stderr was: {stderr}");
}

#[then("one start succeeded and the other exited with code \"{code}\"")]
fn then_one_start_won(world: &RefCell<World>, code: String) {
    let loser: i32 = code.parse().expect("numeric exit code");
    let mut codes = world.borrow().start_codes.clone();
    codes.sort_unstable();
    assert_eq!(codes, [Some(0), Some(loser)]);
}

#[then("the daemon reports \"{state}\"")]
fn then_daemon_reports(world: &RefCell<World>, state: String) {
    let world = world.borrow();
    world
        .harness
        .daemon(&world.transport, "status", None)
        .assert()
        .success()
        .stdout(contains(state));
}

#[then("runs are refused")]
fn then_runs_refused(world: &RefCell<World>) {
    let world = world.borrow();
    wait_for("the daemon to stop answering", || {
        world.harness.daemon(&world.transport, "status", None).output().expect("status").status.code()
            == Some(CONNECTION_REFUSED)
    });
    world
        .harness
        .run(&world.transport, &json!({"frame": 3}))
        .assert()
        .code(CONNECTION_REFUSED);
}

#[then("the connection file is removed")]
fn then_connection_file_removed(world: &RefCell<World>) {
    let world = world.borrow();
    wait_for("the connection file to be removed", || gone(&world.harness.connection_file()));
}

#[then("the callbacks were \"{callbacks}\"")]
fn then_callbacks(world: &RefCell<World>, callbacks: String) {
    let world = world.borrow();
    let expected: Vec<String> = callbacks.split(", ").map(str::to_owned).collect();
    let last = expected.last().cloned().unwrap_or_default();
    wait_for("the last callback", || world.harness.callbacks().contains(&last));
    assert_eq!(world.harness.callbacks(), expected);
}

#[scenario(
    path = "tests/features/daemon_lifecycle.feature",
    name = "Starting, running and stopping a daemon"
)]
fn daemon_round_trip(world: RefCell<World>, transport: String) {
    let _ = (world, transport);
}

#[scenario(
    path = "tests/features/daemon_lifecycle.feature",
    name = "A second start is refused"
)]
fn daemon_second_start(world: RefCell<World>, transport: String) {
    let _ = (world, transport);
}

#[scenario(
    path = "tests/features/daemon_lifecycle.feature",
    name = "Concurrent starts leave one daemon"
)]
fn daemon_concurrent_starts(world: RefCell<World>, transport: String) {
    let _ = (world, transport);
}

#[scenario(
    path = "tests/features/daemon_lifecycle.feature",
    name = "Terminating the daemon cancels the adaptor"
)]
fn daemon_terminated(world: RefCell<World>, transport: String) {
    let _ = (world, transport);
}

#[scenario(
    path = "tests/features/daemon_lifecycle.feature",
    name = "A killed daemon refuses clients"
)]
fn daemon_killed(world: RefCell<World>, transport: String) {
    let _ = (world, transport);
}
