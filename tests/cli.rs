use std::fs;
use std::process::Command;

fn lens() -> Command {
    Command::new(env!("CARGO_BIN_EXE_lens"))
}

#[test]
fn dry_run_prints_plan_without_credentials() {
    let repo = tempfile::tempdir().unwrap();
    fs::create_dir_all(repo.path().join("src")).unwrap();
    fs::write(repo.path().join("src/main.rs"), "fn main() {}\n").unwrap();
    fs::write(repo.path().join("README.md"), "# demo\n").unwrap();
    fs::create_dir_all(repo.path().join(".git")).unwrap();
    fs::write(repo.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();

    let output = lens()
        .arg("--config")
        .arg(repo.path().join("absent.toml"))
        .arg("analyze")
        .arg(repo.path())
        .arg("--dry-run")
        .args(["--progress", "off"])
        .env_remove("OPENROUTER_API_KEY")
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Analysis plan for"));
    assert!(stdout.contains("Files:            2"));
    assert!(stdout.contains("Chunks:           1"));
    assert!(stdout.contains("single pass"));
}

#[test]
fn analyze_without_api_key_fails_cleanly() {
    let repo = tempfile::tempdir().unwrap();
    fs::write(repo.path().join("lib.rs"), "pub fn f() {}\n").unwrap();
    let config = repo.path().join("lens.toml");
    fs::write(&config, "[llm]\napi_key_env = \"LENS_TEST_KEY_THAT_IS_NOT_SET\"\n").unwrap();

    let output = lens()
        .arg("--config")
        .arg(&config)
        .arg("analyze")
        .arg(repo.path())
        .env_remove("LENS_TEST_KEY_THAT_IS_NOT_SET")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("LENS_TEST_KEY_THAT_IS_NOT_SET"), "stderr: {stderr}");
}

#[test]
fn invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("lens.toml");
    fs::write(&config, "[pipeline]\nworkers = 0\n").unwrap();

    let output = lens()
        .arg("--config")
        .arg(&config)
        .arg("analyze")
        .arg(dir.path())
        .arg("--dry-run")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("pipeline.workers"));
}
