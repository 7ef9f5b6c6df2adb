//! Exit codes of the command line front-end.

use std::process::Command;

fn vpx_replay() -> Command {
    Command::new(env!("CARGO_BIN_EXE_vpx-replay"))
}

#[test]
fn help_exits_successfully() {
    let output = vpx_replay().arg("--help").output().unwrap();
    assert!(output.status.success());
    let usage = String::from_utf8_lossy(&output.stdout);
    assert!(usage.contains("--cid"));
    assert!(usage.contains("--name"));
}

#[test]
fn missing_arguments_fail() {
    let output = vpx_replay().arg("drive.rec").output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn unreadable_recording_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.rec");

    let output = vpx_replay()
        .args(["--cid=111", "--name=vpx-replay-cli-test"])
        .arg(&missing)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn empty_recording_completes() {
    let dir = tempfile::tempdir().unwrap();
    let recording = dir.path().join("empty.rec");
    std::fs::write(&recording, b"").unwrap();

    let output = vpx_replay()
        .args(["--cid=111", "--name=vpx-replay-cli-empty"])
        .arg(&recording)
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
}

#[cfg(not(feature = "ffmpeg"))]
#[test]
fn missing_decoder_backend_is_reported_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let recording = dir.path().join("empty.rec");
    std::fs::write(&recording, b"").unwrap();

    let output = vpx_replay()
        .env_remove("RUST_LOG")
        .args(["--cid=111", "--name=vpx-replay-cli-backend"])
        .arg(&recording)
        .output()
        .unwrap();
    assert!(output.status.success());
    let log = String::from_utf8_lossy(&output.stdout);
    assert!(log.contains("--features ffmpeg"), "log: {}", log);
}
