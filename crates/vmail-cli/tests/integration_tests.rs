use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("vmail").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("visual model-based adversarial imitation learning"));
}

#[test]
fn test_cli_list() {
    let mut cmd = Command::cargo_bin("vmail").unwrap();
    cmd.arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Available environments:"))
        .stdout(predicate::str::contains("point_reach"));
}

#[test]
fn test_cli_list_empty_dir() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("vmail").unwrap();
    cmd.arg("list")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("0 episodes, 0 steps"));
}

#[test]
fn test_cli_collect_expert() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("expert");
    let mut cmd = Command::cargo_bin("vmail").unwrap();
    cmd.arg("collect-expert")
        .arg("--episodes")
        .arg("2")
        .arg("--time-limit")
        .arg("20")
        .arg("--out")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("Recorded 2 episodes"));

    let mut cmd = Command::cargo_bin("vmail").unwrap();
    cmd.arg("list")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("2 episodes"));
}

#[test]
fn test_cli_unknown_env() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("vmail").unwrap();
    cmd.arg("collect-expert")
        .arg("--env")
        .arg("cartpole")
        .arg("--out")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown env 'cartpole'"));
}

#[test]
fn test_cli_train_requires_expert_data() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("vmail").unwrap();
    cmd.arg("train")
        .arg("--small")
        .arg("--basedir")
        .arg(dir.path())
        .arg("--expert-dir")
        .arg(dir.path().join("none"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("no expert episodes"));
}

#[test]
fn test_cli_train_short_run() {
    let dir = TempDir::new().unwrap();
    let expert = dir.path().join("expert");
    Command::cargo_bin("vmail")
        .unwrap()
        .args(["collect-expert", "--episodes", "2", "--time-limit", "30", "--out"])
        .arg(&expert)
        .assert()
        .success();

    Command::cargo_bin("vmail")
        .unwrap()
        .arg("train")
        .arg("--small")
        .arg("--basedir")
        .arg(dir.path().join("run"))
        .arg("--expert-dir")
        .arg(&expert)
        .args(["--steps", "20"])
        .args(["--set", "prefill=40"])
        .args(["--set", "eval_every=20"])
        .args(["--set", "time_limit=20"])
        .args(["--set", "train_every=10"])
        .args(["--set", "train_steps=1"])
        .args(["--set", "pretrain=1"])
        .args(["--set", "batch_size=2"])
        .args(["--set", "batch_length=5"])
        .assert()
        .success();

    assert!(dir.path().join("run/logdir/variables.ot").exists());
    assert!(dir.path().join("run/logdir/config.json").exists());
}
