use std::process::Command;

fn run(fixture: &str, envs: &[(&str, &str)]) -> (String, String, bool) {
    let path = format!("tests/fixtures/{fixture}");
    let output = Command::new(env!("CARGO_BIN_EXE_ledger-bank"))
        .arg(&path)
        .env("RUST_LOG", "warn")
        .env("BANK_PBKDF2_ROUNDS", "1000")
        .envs(envs.iter().copied())
        .output()
        .expect("failed to run binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

const VALID_BALANCES: [&str; 5] = [
    "owner,type,balance,active",
    "alice,Savings,50.00,true",
    "alice,Checking,0.00,true",
    "bob,Savings,50.00,true",
    "bob,Checking,30.00,false",
];

#[test]
fn valid_script() {
    let (stdout, stderr, success) = run("valid.csv", &[]);

    assert!(success);
    assert!(stderr.is_empty(), "unexpected warnings: {stderr}");

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, VALID_BALANCES);
}

#[test]
fn valid_script_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("ledger.db");
    let (stdout, stderr, success) = run(
        "valid.csv",
        &[
            ("BANK_STORE", "sqlite"),
            ("BANK_SQLITE_PATH", db.to_str().unwrap()),
        ],
    );

    assert!(success, "{stderr}");
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, VALID_BALANCES);
    assert!(db.exists());
}

#[test]
fn errors_warn_but_do_not_block() {
    let (stdout, stderr, success) = run("with_errors.csv", &[]);

    assert!(success);
    assert!(stderr.contains("unrecognized op"));
    assert!(stderr.contains("missing amount"));
    assert!(stderr.contains("transaction PIN is not set"));
    assert!(stderr.contains("insufficient funds"));
    assert!(stderr.contains("session expired"));
    assert!(stderr.contains("login required"));

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], "owner,type,balance,active");
    assert_eq!(lines[1], "alice,Savings,75.00,true");
    assert_eq!(lines[2], "alice,Checking,0.00,true");
}

#[test]
fn bad_configuration_fails_fast() {
    let (stdout, stderr, success) = run("valid.csv", &[("BANK_STORE", "postgres")]);

    assert!(!success);
    assert!(stdout.is_empty());
    assert!(stderr.contains("unknown store backend"));
}
