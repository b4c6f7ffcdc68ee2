//! Integration tests for the supervise CLI.
//!
//! Everything here exercises the argument validation and grain path checks,
//! which all run before any namespace or mount operation, so the suite
//! passes without privileges.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::process::Command;
use tempfile::TempDir;

struct GrainDirs {
    _root: TempDir,
    pkg: std::path::PathBuf,
    var: std::path::PathBuf,
}

/// A package directory plus a var path (not created) inside a tempdir.
fn grain_dirs() -> GrainDirs {
    let root = tempfile::tempdir().unwrap();
    let pkg = root.path().join("pkg");
    fs::create_dir(&pkg).unwrap();
    let var = root.path().join("var");
    GrainDirs {
        _root: root,
        pkg,
        var,
    }
}

fn supervise_cmd(dirs: &GrainDirs) -> Command {
    let mut cmd = Command::cargo_bin("supervise").expect("supervise binary not found");
    cmd.arg("--pkg").arg(&dirs.pkg).arg("--var").arg(&dirs.var);
    cmd
}

#[test]
fn help_documents_the_surface() {
    Command::cargo_bin("supervise")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--pkg")
                .and(predicate::str::contains("--var"))
                .and(predicate::str::contains("--env"))
                .and(predicate::str::contains("--proc"))
                .and(predicate::str::contains("--stdio"))
                .and(predicate::str::contains("--dev"))
                .and(predicate::str::contains("--seccomp-dump-pfc"))
                .and(predicate::str::contains("--new")),
        );
}

#[test]
fn command_is_required() {
    let dirs = grain_dirs();
    supervise_cmd(&dirs)
        .arg("app")
        .arg("grain1")
        .assert()
        .failure();
}

#[test]
fn app_name_with_slash_is_rejected() {
    let dirs = grain_dirs();
    supervise_cmd(&dirs)
        .args(["bad/app", "grain1", "/bin/true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid app name."));
}

#[test]
fn grain_id_with_slash_is_rejected() {
    let dirs = grain_dirs();
    supervise_cmd(&dirs)
        .args(["app", "bad/grain", "/bin/true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid grain id."));
}

#[test]
fn env_without_value_is_rejected() {
    let dirs = grain_dirs();
    supervise_cmd(&dirs)
        .args(["-e", "NOVALUE", "app", "grain1", "/bin/true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("NOVALUE"));
}

#[test]
fn new_grain_over_existing_var_reports_grain_exists() {
    let dirs = grain_dirs();
    fs::create_dir(&dirs.var).unwrap();
    supervise_cmd(&dirs)
        .args(["--new", "app", "grain1", "/bin/true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Grain already exists: grain1"));
}

#[test]
fn missing_grain_reports_no_such_grain() {
    let dirs = grain_dirs();
    supervise_cmd(&dirs)
        .args(["app", "grain9", "/bin/true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No such grain: grain9"));
}

#[test]
fn missing_package_is_a_fault() {
    let dirs = grain_dirs();
    fs::remove_dir(&dirs.pkg).unwrap();
    supervise_cmd(&dirs)
        .args(["app", "grain1", "/bin/true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("package not accessible"));
}
