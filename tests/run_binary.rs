use std::process::Command;

#[test]
fn prints_help() {
    let output = Command::new(env!("CARGO_BIN_EXE_powerkitd"))
        .arg("--help")
        .output()
        .expect("failed to execute process");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--backend"));
    assert!(stdout.contains("--no-bus"));
}

#[test]
fn rejects_unknown_backend() {
    let output = Command::new(env!("CARGO_BIN_EXE_powerkitd"))
        .args(["--backend", "martian"])
        .output()
        .expect("failed to execute process");
    assert!(!output.status.success());
}
