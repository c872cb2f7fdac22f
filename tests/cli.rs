use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn solpipe(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_solpipe"))
        .args(args)
        .env("RUST_LOG", "solpipe=warn")
        .output()
        .expect("run solpipe")
}

fn write_input(dir: &Path) -> String {
    let input = dir.join("input.fasta");
    fs::write(&input, ">p1\nMKV\n>p2\nMLL\n>p3\nGGW\n").expect("write fasta");
    input.to_string_lossy().into_owned()
}

#[test]
fn missing_required_flags_fail() {
    let output = solpipe(&[]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--input-sequences"), "stderr: {stderr}");
}

#[test]
fn zero_batch_size_is_a_configuration_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_input(dir.path());
    let out = dir.path().join("out.csv");
    let output = solpipe(&[
        "--input-sequences",
        &input,
        "--output",
        out.to_str().expect("utf8 path"),
        "--batch-size",
        "0",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("configuration failed"), "stderr: {stderr}");
}

#[cfg(unix)]
#[test]
fn failing_embedding_command_names_the_stage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_input(dir.path());
    let out = dir.path().join("out.csv");
    let scratch = dir.path().join("scratch");
    let output = solpipe(&[
        "--input-sequences",
        &input,
        "--output",
        out.to_str().expect("utf8 path"),
        "--embed-command",
        "false",
        "--workdir-root",
        scratch.to_str().expect("utf8 path"),
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("embedding failed"), "stderr: {stderr}");
    assert!(!out.exists());
    assert_eq!(fs::read_dir(&scratch).expect("scratch").count(), 0);
}

#[test]
fn unreachable_embedding_service_fails_the_stage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = write_input(dir.path());
    let out = dir.path().join("out.csv");
    let output = Command::new(env!("CARGO_BIN_EXE_solpipe"))
        .args([
            "--input-sequences",
            &input,
            "--output",
            out.to_str().expect("utf8 path"),
            "--batch-size",
            "2",
            "--embed-command",
            env!("CARGO_BIN_EXE_solpipe-embed"),
        ])
        .env("SOLPIPE_EMBED_ENDPOINT", "http://127.0.0.1:9/v1")
        .env("SOLPIPE_EMBED_TIMEOUT_SECS", "2")
        .output()
        .expect("run solpipe");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("embedding failed"), "stderr: {stderr}");
    assert!(!out.exists());
}

#[test]
fn embed_binary_rejects_missing_descriptor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("embed_config.yml");
    let output = Command::new(env!("CARGO_BIN_EXE_solpipe-embed"))
        .args(["--config", missing.to_str().expect("utf8 path")])
        .output()
        .expect("run solpipe-embed");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to load descriptor"), "stderr: {stderr}");
}
