// CLI integration tests driving the built `vaultdb` binary.
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

fn cmd(dir: &Path) -> Command {
    let exe = env!("CARGO_BIN_EXE_vaultdb");
    let mut command = Command::new(exe);
    command.env_remove("VAULTDB_KEYSTORE").arg("--dir").arg(dir);
    command
}

fn run(dir: &Path, args: &[&str]) -> Output {
    cmd(dir).args(args).output().expect("run vaultdb")
}

fn stdout_json(output: &Output) -> Value {
    let text = std::str::from_utf8(&output.stdout).expect("utf8");
    serde_json::from_str(text.trim()).expect("valid json")
}

fn stderr_json(output: &Output) -> Value {
    let text = String::from_utf8_lossy(&output.stderr);
    let line = text
        .lines()
        .rev()
        .find(|line| line.starts_with('{'))
        .expect("json error line");
    serde_json::from_str(line).expect("valid json")
}

const USERS: &str = r#"{"table":"users","columns":[
    {"name":"id","type":"INT","primary_key":true},
    {"name":"name","type":"VARCHAR(16)","not_null":true},
    {"name":"password","type":"TEXT","encrypted":true}
]}"#;

#[test]
fn create_insert_scan_delete_flow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();

    let init = run(dir, &["init"]);
    assert!(init.status.success());
    let init_json = stdout_json(&init);
    assert!(init_json["key_id"].as_str().is_some_and(|id| !id.is_empty()));
    assert!(dir.join("keystore.json").exists());

    let create = run(dir, &["create-table", USERS]);
    assert!(create.status.success(), "{}", String::from_utf8_lossy(&create.stderr));
    assert_eq!(stdout_json(&create)["created"]["table"], "users");

    for values in [r#"[1, "ada", "secret123"]"#, r#"[2, "bob", null]"#, r#"[3, "cy", "pw"]"#] {
        let insert = run(dir, &["insert", "users", values]);
        assert!(insert.status.success(), "{}", String::from_utf8_lossy(&insert.stderr));
    }

    let scan = run(dir, &["scan", "users", "--eq", "id=1"]);
    assert!(scan.status.success());
    let scan_json = stdout_json(&scan);
    assert_eq!(scan_json["count"], 1);
    assert_eq!(scan_json["rows"][0]["values"]["password"], "secret123");

    let delete = run(dir, &["delete", "users", "--eq", "name=bob"]);
    assert!(delete.status.success());
    assert_eq!(stdout_json(&delete)["deleted"], 1);

    let projected = run(dir, &["scan", "users", "--columns", "name"]);
    let projected_json = stdout_json(&projected);
    assert_eq!(projected_json["count"], 2);
    assert!(projected_json["rows"][0]["values"].get("password").is_none());

    let tables = run(dir, &["tables"]);
    let tables_json = stdout_json(&tables);
    assert_eq!(tables_json["tables"][0]["live_rows"], 2);
    assert_eq!(tables_json["tables"][0]["tombstones"], 1);

    let table_file = std::fs::read(dir.join("tables").join("users.tbl")).expect("tbl");
    assert!(!table_file.windows(9).any(|window| window == b"secret123"));

    let doctor = run(dir, &["doctor"]);
    assert!(doctor.status.success());
    assert_eq!(stdout_json(&doctor)["report"]["status"], "ok");
}

#[test]
fn errors_are_json_with_mapped_exit_codes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    assert!(run(dir, &["create-table", USERS]).status.success());
    assert!(run(dir, &["insert", "users", r#"[1, "ada", "x"]"#]).status.success());

    let duplicate = run(dir, &["insert", "users", r#"[1, "eve", "y"]"#]);
    assert_eq!(duplicate.status.code(), Some(10));
    let err = stderr_json(&duplicate);
    assert_eq!(err["error"]["kind"], "Constraint");
    assert_eq!(err["error"]["table"], "users");

    let null_name = run(dir, &["insert", "users", r#"[2, null, "y"]"#]);
    assert_eq!(null_name.status.code(), Some(9));

    let missing = run(dir, &["scan", "nope"]);
    assert_eq!(missing.status.code(), Some(9));
    assert_eq!(stderr_json(&missing)["error"]["kind"], "Schema");

    let exists = run(dir, &["create-table", USERS]);
    assert_eq!(exists.status.code(), Some(4));

    std::fs::remove_file(dir.join("keystore.json")).expect("remove keystore");
    let locked_out = run(dir, &["tables"]);
    assert_eq!(locked_out.status.code(), Some(12));
    assert!(stderr_json(&locked_out)["error"]["hint"].as_str().is_some());
}

#[test]
fn wal_command_lists_records_without_images() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    assert!(run(dir, &["create-table", USERS]).status.success());
    // Every command closes cleanly, which checkpoints, so the log is empty.
    let wal = run(dir, &["wal"]);
    assert!(wal.status.success());
    let wal_json = stdout_json(&wal);
    assert!(wal_json["records"].as_array().is_some_and(Vec::is_empty));
    assert!(wal_json["damage"].is_null());
}

#[test]
fn keystore_location_is_configurable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let keys = tempfile::tempdir().expect("keys");
    let keystore = keys.path().join("vault.keys");
    let output = cmd(temp.path())
        .arg("--keystore")
        .arg(&keystore)
        .arg("init")
        .output()
        .expect("init");
    assert!(output.status.success());
    assert!(keystore.exists());
    assert!(!temp.path().join("keystore.json").exists());
}

#[test]
fn bad_arguments_are_usage_errors() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = run(temp.path(), &["delete", "users"]);
    assert_eq!(output.status.code(), Some(2));
    let output = run(temp.path(), &["insert", "users", "not json"]);
    assert_ne!(output.status.code(), Some(0));
}
