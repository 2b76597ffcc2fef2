#![cfg(target_os = "linux")]

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Isolated home; stops whatever is still running when dropped.
struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    fn work_dir(&self) -> &Path {
        self.dir.path()
    }

    fn pm(&self) -> Command {
        let mut cmd: Command = cargo_bin_cmd!("pm").into();
        cmd.env("PM_HOME", self.home());
        cmd.env_remove("PM_PMID");
        cmd.current_dir(self.work_dir());
        cmd.timeout(Duration::from_secs(30));
        cmd
    }

    fn list(&self) -> Vec<Value> {
        let output = self.pm().args(["list", "--json"]).output().unwrap();
        assert!(output.status.success(), "list failed: {output:?}");
        match serde_json::from_slice(&output.stdout).unwrap() {
            Value::Array(views) => views,
            other => panic!("expected array, got {other}"),
        }
    }

    fn view(&self, name: &str) -> Value {
        self.list()
            .into_iter()
            .find(|v| v["name"] == name)
            .unwrap_or_else(|| panic!("{name} not listed"))
    }

    fn wait_for(&self, name: &str, live: &str) -> Value {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let view = self.view(name);
            if view["live"] == live {
                return view;
            }
            assert!(
                Instant::now() < deadline,
                "{name} never became {live}, last: {view}"
            );
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        let _ = self.pm().arg("stop").output();
    }
}

/// Polls `check` every 100 ms until it holds or `limit` passes.
fn wait_until(limit: Duration, what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn stdout_of(view: &Value) -> String {
    std::fs::read_to_string(view["stdout_file"].as_str().unwrap()).unwrap_or_default()
}

fn child_pid(view: &Value) -> u64 {
    view["stat"]["child_pid"]
        .as_u64()
        .unwrap_or_else(|| panic!("no child pid in {view}"))
}

#[test]
fn test_e2e_no_args_prints_help() {
    let env = Env::new();
    env.pm()
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn test_e2e_create_does_not_start() {
    let env = Env::new();
    env.pm()
        .args(["create", "--name", "idle", "--tag", "group", "--", "sleep", "30"])
        .assert()
        .success()
        .stdout(predicate::str::contains("created: idle"));

    let view = env.view("idle");
    assert_eq!(view["live"], "stopped");
    let command = view["command"].as_str().unwrap();
    assert!(command.starts_with('/') && command.ends_with("/sleep"), "{command}");
    assert_eq!(view["args"], serde_json::json!(["30"]));
    assert_eq!(view["tags"], serde_json::json!(["group", "all"]));
    assert!(view["stat"].is_null());
}

#[test]
fn test_e2e_unknown_program_is_not_stored() {
    let env = Env::new();
    env.pm()
        .args(["run", "--name", "ghost", "--", "definitely-not-a-program-xyz"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("executable not found"));
    assert!(env.list().is_empty());
}

#[test]
fn test_e2e_create_same_name_keeps_id() {
    let env = Env::new();
    env.pm()
        .args(["create", "--name", "web", "--", "sleep", "1"])
        .assert()
        .success();
    let first = env.view("web");

    env.pm()
        .args(["create", "--name", "web", "--env", "A=1", "--", "sleep", "2"])
        .assert()
        .success();
    let list = env.list();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], first["id"]);
    assert_eq!(list[0]["args"], serde_json::json!(["2"]));
    assert_eq!(list[0]["env"]["A"], "1");
}

#[test]
fn test_e2e_run_then_stop() {
    let env = Env::new();
    env.pm()
        .args(["run", "--name", "sleeper", "--", "sleep", "30"])
        .assert()
        .success()
        .stdout(predicate::str::contains("started: sleeper"));

    let view = env.wait_for("sleeper", "running");
    let supervisor = view["stat"]["supervisor_pid"].as_u64().unwrap();
    assert_ne!(supervisor, child_pid(&view));

    let output = env.pm().arg("ls").output().unwrap();
    let table = String::from_utf8_lossy(&output.stdout);
    let row = Regex::new(r"sleeper\W+[0-9a-f]{6}\W+running\W+\d+\W+\d+").unwrap();
    assert!(row.is_match(&table), "unexpected table:\n{table}");

    // a second start is a no-op
    env.pm()
        .args(["start", "sleeper"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already running: sleeper"));

    env.pm()
        .args(["stop", "sleeper"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stopped: sleeper"));
    assert_eq!(env.view("sleeper")["live"], "stopped");
}

#[test]
fn test_e2e_stop_one_by_name_others_keep_running() {
    let env = Env::new();
    std::fs::write(
        env.work_dir().join("pm.toml"),
        r#"
[web]
command = "sleep 60"

[worker]
command = "sleep 60"
"#,
    )
    .unwrap();

    env.pm().args(["run", "--config", "pm.toml"]).assert().success();
    env.wait_for("web", "running");
    env.wait_for("worker", "running");

    env.pm().args(["stop", "web"]).assert().success();

    assert_eq!(env.view("web")["live"], "stopped");
    assert_eq!(env.view("worker")["live"], "running");
}

#[test]
fn test_e2e_select_by_tag() {
    let env = Env::new();
    for (name, tag) in [("a", "batch"), ("b", "batch"), ("c", "other")] {
        env.pm()
            .args(["create", "--name", name, "--tag", tag, "--", "true"])
            .assert()
            .success();
    }

    let output = env.pm().args(["list", "--json", "batch"]).output().unwrap();
    let views: Vec<Value> = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<&str> = views.iter().map(|v| v["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[test]
fn test_e2e_unknown_selector_fails() {
    let env = Env::new();
    env.pm()
        .args(["stop", "nonexistent"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no process matches nonexistent"));
}

#[test]
fn test_e2e_restart_gets_new_child() {
    let env = Env::new();
    env.pm()
        .args(["run", "--name", "svc", "--", "sleep", "60"])
        .assert()
        .success();
    let before = child_pid(&env.wait_for("svc", "running"));

    env.pm()
        .args(["restart", "svc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("started: svc"));

    let after = child_pid(&env.wait_for("svc", "running"));
    assert_ne!(before, after);
}

#[test]
fn test_e2e_logs_capture_output() {
    let env = Env::new();
    env.pm()
        .args([
            "run",
            "--name",
            "talker",
            "--",
            "sh",
            "-c",
            "echo hello-out; echo hello-err >&2",
        ])
        .assert()
        .success();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let output = env.pm().args(["logs", "talker"]).output().unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("hello-out") && stdout.contains("hello-err") {
            break;
        }
        assert!(Instant::now() < deadline, "logs never appeared: {stdout}");
        std::thread::sleep(Duration::from_millis(100));
    }

    let view = env.wait_for("talker", "stopped");
    assert_eq!(view["status"]["status"], "stopped");
    assert_eq!(view["status"]["exit_code"], 0);
}

#[test]
fn test_e2e_signal_reaches_child() {
    let env = Env::new();
    env.pm()
        .args([
            "run",
            "--name",
            "trapper",
            "--",
            "sh",
            "-c",
            "trap 'echo got-usr1' USR1; while true; do sleep 0.1; done",
        ])
        .assert()
        .success();
    env.wait_for("trapper", "running");
    // let the shell install its trap
    std::thread::sleep(Duration::from_millis(300));

    env.pm()
        .args(["signal", "usr1", "trapper"])
        .assert()
        .success()
        .stdout(predicate::str::contains("signalled: trapper"));

    let stdout_file = PathBuf::from(env.view("trapper")["stdout_file"].as_str().unwrap());
    let deadline = Instant::now() + Duration::from_secs(5);
    while !std::fs::read_to_string(&stdout_file)
        .unwrap_or_default()
        .contains("got-usr1")
    {
        assert!(Instant::now() < deadline, "trap never ran");
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn test_e2e_signal_rejects_unknown_name() {
    let env = Env::new();
    env.pm()
        .args(["create", "--name", "x", "--", "true"])
        .assert()
        .success();
    env.pm()
        .args(["signal", "BOGUS", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("BOGUS"));
}

#[test]
fn test_e2e_delete_removes_record_and_logs() {
    let env = Env::new();
    env.pm()
        .args(["run", "--name", "gone", "--", "sleep", "60"])
        .assert()
        .success();
    let view = env.wait_for("gone", "running");
    let stdout_file = PathBuf::from(view["stdout_file"].as_str().unwrap());
    assert!(stdout_file.exists());

    env.pm()
        .args(["rm", "gone"])
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted: gone"));

    assert!(env.list().is_empty());
    assert!(!stdout_file.exists());
}

#[test]
fn test_e2e_invalid_watch_pattern_marks_invalid() {
    let env = Env::new();
    env.pm()
        .args(["run", "--name", "bad", "--watch", "(", "--", "sleep", "60"])
        .assert()
        .success();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let view = env.view("bad");
        if view["status"]["status"] == "invalid" {
            assert_eq!(view["live"], "stopped");
            break;
        }
        assert!(Instant::now() < deadline, "never marked invalid: {view}");
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn test_e2e_term_escalates_to_kill_for_stubborn_child() {
    let env = Env::new();
    env.pm()
        .args([
            "run",
            "--name",
            "stubborn",
            "--kill-timeout",
            "300",
            "--",
            "sh",
            "-c",
            "trap '' TERM; echo ready; while true; do sleep 0.1; done",
        ])
        .assert()
        .success();
    let view = env.wait_for("stubborn", "running");
    let pid = child_pid(&view);
    wait_until(Duration::from_secs(5), "trap to be installed", || {
        stdout_of(&view).contains("ready")
    });

    let sent = Instant::now();
    env.pm()
        .args(["signal", "TERM", "stubborn"])
        .assert()
        .success();

    // kill timeout plus the stop grace, with slack for a loaded machine
    let limit = Duration::from_millis(300) + Duration::from_secs(2) + Duration::from_secs(2);
    let stopped = env.wait_for("stubborn", "stopped");
    assert!(sent.elapsed() < limit, "took {:?}", sent.elapsed());
    wait_until(limit, "child to disappear", || {
        !Path::new(&format!("/proc/{pid}")).exists()
    });
    assert_eq!(stopped["status"]["status"], "stopped");
    assert_eq!(stopped["status"]["exit_code"], 137);
}

#[test]
fn test_e2e_watch_relaunches_once_per_change() {
    let env = Env::new();
    env.pm()
        .args([
            "run",
            "--name",
            "idler",
            "--watch",
            r"\.txt$",
            "--",
            "sh",
            "-c",
            "echo launched",
        ])
        .assert()
        .success();

    let view = env.view("idler");
    wait_until(Duration::from_secs(10), "first launch", || {
        stdout_of(&view).matches("launched").count() == 1
    });
    // the supervisor stays behind, waiting for a change
    env.wait_for("idler", "created");
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(env.view("idler")["live"], "created");
    assert_eq!(stdout_of(&view).matches("launched").count(), 1);

    std::fs::write(env.work_dir().join("trigger.txt"), "x").unwrap();
    wait_until(Duration::from_secs(10), "relaunch", || {
        stdout_of(&view).matches("launched").count() >= 2
    });
    std::thread::sleep(Duration::from_secs(1));
    assert_eq!(stdout_of(&view).matches("launched").count(), 2);
    assert_eq!(env.wait_for("idler", "created")["live"], "created");
}
