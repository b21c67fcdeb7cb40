//! CLI contract tests for unionfs argument validation.

use std::path::PathBuf;

use tempfile::tempdir;
use unionfs::cli::{clap_command, parse_args, serve::build_config};
use unionfs::logging::LogFormat;
use unionfs::Error;

fn expect_error(args: &[&str], expected: Error) {
    let err = unionfs::run(args.iter().copied()).expect_err("command should fail");
    let actual = err
        .downcast_ref::<Error>()
        .unwrap_or_else(|| panic!("unexpected error type: {err:?}"));
    assert_eq!(
        std::mem::discriminant(actual),
        std::mem::discriminant(&expected),
        "got {actual:?}"
    );
}

#[test]
fn empty_branch_list_is_fatal() {
    expect_error(&["unionfs", "-i"], Error::EmptyBranchList);
    expect_error(
        &["unionfs", "-i", "/does/not/exist", "/nor/this"],
        Error::EmptyBranchList,
    );
}

#[test]
fn only_one_creation_branch() {
    let a = tempdir().unwrap();
    let b = tempdir().unwrap();
    let a = a.path().to_str().unwrap();
    let b = b.path().to_str().unwrap();
    expect_error(
        &["unionfs", "-i", a, "-c", a, "-c", b],
        Error::MultipleCreateBranches,
    );
    expect_error(&["unionfs", "-i", "-c", a, "-c", b], Error::MultipleCreateBranches);
}

#[test]
fn stdio_conflicts_with_socket_and_mountpoint() {
    let a = tempdir().unwrap();
    let a = a.path().to_str().unwrap();
    expect_error(&["unionfs", "-i", "-s", "/tmp/sock", a], Error::Cli(String::new()));
    expect_error(&["unionfs", "-i", "-m", "/mnt/x", a], Error::Cli(String::new()));
}

#[test]
fn flags_and_markers_parse_into_serve_args() -> unionfs::Result<()> {
    let args = parse_args([
        "unionfs",
        "-D",
        "-s",
        "/run/union.sock",
        "--log-format",
        "json",
        "/upper",
        "-c",
        "/lower",
    ])?;
    assert!(args.serve.chatty);
    assert!(!args.serve.create_first);
    assert_eq!(args.serve.srv, Some(PathBuf::from("/run/union.sock")));
    assert_eq!(args.serve.paths, vec!["/upper", "-c", "/lower"]);
    assert_eq!(args.log_format, LogFormat::Json);
    assert!(args.logging().debug);

    // -s without -m serves without mounting.
    assert_eq!(args.serve.effective_mountpoint(), None);
    Ok(())
}

#[test]
fn mountpoint_defaults_only_without_other_transports() -> unionfs::Result<()> {
    let plain = parse_args(["unionfs", "/a"])?;
    assert_eq!(
        plain.serve.effective_mountpoint(),
        Some(PathBuf::from("/mnt/union"))
    );

    let stdio = parse_args(["unionfs", "-i", "/a"])?;
    assert_eq!(stdio.serve.effective_mountpoint(), None);

    let explicit = parse_args(["unionfs", "-s", "/tmp/s", "-m", "/srv/u", "/a"])?;
    assert_eq!(
        explicit.serve.effective_mountpoint(),
        Some(PathBuf::from("/srv/u"))
    );
    Ok(())
}

#[test]
fn leading_create_flag_marks_first_branch() -> unionfs::Result<()> {
    let a = tempdir()?;
    let b = tempdir()?;
    let args = parse_args([
        "unionfs",
        "-i",
        "-c",
        a.path().to_str().unwrap(),
        b.path().to_str().unwrap(),
    ])?;
    assert!(args.serve.create_first);
    let config = build_config(&args.serve)?;
    let flags: Vec<bool> = config.branches().iter().map(|b| b.create).collect();
    assert_eq!(flags, vec![true, false]);
    Ok(())
}

#[test]
fn help_lists_every_option() {
    let help = clap_command().render_help().to_string();
    for needle in ["-D", "-i", "-s", "-m", "-c", "--no-pivot", "--max-workers", "--log-format", "PATH"] {
        assert!(help.contains(needle), "help is missing {needle}:\n{help}");
    }
}
