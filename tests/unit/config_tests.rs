use std::{fs, sync::Arc};

use tempfile::tempdir;
use unionfs::config::{clean_path, BranchArgs, Config};
use unionfs::fs::pivot::ScratchPool;
use unionfs::Error;

fn paths(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn config_for(items: &[&str], create_first: bool) -> unionfs::Result<Config> {
    let list = paths(items);
    Config::from_args(BranchArgs {
        paths: &list,
        create_first,
        ..Default::default()
    })
}

#[test]
fn first_branch_creates_when_none_marked() -> unionfs::Result<()> {
    let a = tempdir()?;
    let b = tempdir()?;
    let config = config_for(
        &[a.path().to_str().unwrap(), b.path().to_str().unwrap()],
        false,
    )?;
    let flags: Vec<bool> = config.branches().iter().map(|b| b.create).collect();
    assert_eq!(flags, vec![true, false]);
    Ok(())
}

#[test]
fn marker_flags_the_following_path() -> unionfs::Result<()> {
    let a = tempdir()?;
    let b = tempdir()?;
    let config = config_for(
        &[a.path().to_str().unwrap(), "-c", b.path().to_str().unwrap()],
        false,
    )?;
    let branches = config.branches();
    assert_eq!(branches.len(), 2);
    assert!(!branches[0].create);
    assert!(branches[1].create);
    assert_eq!(branches[1].root, b.path());
    Ok(())
}

#[test]
fn create_first_flags_the_first_retained_path() -> unionfs::Result<()> {
    let a = tempdir()?;
    let missing = a.path().join("missing");
    let b = tempdir()?;
    let config = config_for(
        &[missing.to_str().unwrap(), b.path().to_str().unwrap()],
        true,
    )?;
    assert_eq!(config.branches().len(), 1);
    assert!(config.branches()[0].create);
    assert_eq!(config.branches()[0].root, b.path());
    Ok(())
}

#[test]
fn second_marker_is_rejected() -> unionfs::Result<()> {
    let a = tempdir()?;
    let b = tempdir()?;
    let err = config_for(
        &["-c", a.path().to_str().unwrap(), "-c", b.path().to_str().unwrap()],
        false,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::MultipleCreateBranches)
    ));

    let err = config_for(&["-c", a.path().to_str().unwrap()], true).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::MultipleCreateBranches)
    ));
    Ok(())
}

#[test]
fn trailing_marker_is_a_usage_error() -> unionfs::Result<()> {
    let a = tempdir()?;
    let err = config_for(&[a.path().to_str().unwrap(), "-c"], false).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Cli(_))));
    Ok(())
}

#[test]
fn missing_and_non_directory_paths_are_skipped() -> unionfs::Result<()> {
    let a = tempdir()?;
    let file = a.path().join("plain");
    fs::write(&file, b"x")?;
    let err = config_for(
        &[file.to_str().unwrap(), "/definitely/not/here"],
        false,
    )
    .unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::EmptyBranchList)));

    let err = config_for(&[], false).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::EmptyBranchList)));
    Ok(())
}

#[test]
fn paths_are_cleaned() -> unionfs::Result<()> {
    let a = tempdir()?;
    fs::create_dir(a.path().join("sub"))?;
    let messy = format!("{}//sub/./../sub/", a.path().display());
    let config = config_for(&[messy.as_str()], false)?;
    assert_eq!(config.branches()[0].root, a.path().join("sub"));
    assert_eq!(clean_path("a/./b//c/.."), std::path::PathBuf::from("a/b"));
    Ok(())
}

#[test]
fn branches_away_from_the_mountpoint_are_not_pivoted() -> unionfs::Result<()> {
    let a = tempdir()?;
    let scratch = tempdir()?;
    let mtpt = a.path().join("elsewhere");
    let list = paths(&[a.path().to_str().unwrap()]);
    let pool = Arc::new(ScratchPool::new(scratch.path()));
    let config = Config::from_args(BranchArgs {
        paths: &list,
        create_first: false,
        mountpoint: Some(&mtpt),
        pivot_pool: Some(Arc::clone(&pool)),
    })?;
    let (branches, pivots) = config.into_parts();
    assert!(pivots.is_empty());
    assert_eq!(branches[0].root, a.path());
    assert_eq!(pool.free_slots(), 0);
    Ok(())
}
