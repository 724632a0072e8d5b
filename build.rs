// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;

/// Common argument: installable name filter terms
fn filter_arg() -> Arg {
    Arg::new("filter")
        .num_args(0..)
        .help("Filter terms; every term must appear in the installable name")
}

/// Common argument: dry run
fn dry_run_arg() -> Arg {
    Arg::new("dry_run")
        .long("dry-run")
        .action(ArgAction::SetTrue)
        .help("Show what would happen without changing anything")
}

fn defer_cleanup_arg() -> Arg {
    Arg::new("defer_cleanup")
        .long("defer-cleanup")
        .action(ArgAction::SetTrue)
        .help("Rename replaced entries to .DELETE_ME_<timestamp> instead of deleting them")
}

fn build_cli() -> Command {
    Command::new("cefs")
        .version(env!("CARGO_PKG_VERSION"))
        .author("CEFS Contributors")
        .about("Content-addressed squashfs layer store")
        .arg(Arg::new("config").short('c').long("config").global(true).help("Configuration file"))
        .arg(Arg::new("image_root").long("image-root").global(true).help("Override image root"))
        .arg(Arg::new("mount_point").long("mount-point").global(true).help("Override mount point"))
        .arg(
            Arg::new("namespace_root")
                .long("namespace-root")
                .global(true)
                .help("Override namespace root"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Debug logging"),
        )
        .subcommand(
            Command::new("install")
                .about("Build images from a staging tree and deploy them")
                .arg(Arg::new("staging_root").required(true).help("Staging tree root"))
                .arg(filter_arg())
                .arg(dry_run_arg())
                .arg(defer_cleanup_arg()),
        )
        .subcommand(
            Command::new("convert")
                .about("Convert installed directories into CEFS images")
                .arg(filter_arg())
                .arg(dry_run_arg())
                .arg(defer_cleanup_arg()),
        )
        .subcommand(
            Command::new("consolidate")
                .about("Merge many single-content images into consolidated images")
                .arg(filter_arg())
                .arg(dry_run_arg())
                .arg(Arg::new("max_size").long("max-size").help("Maximum bytes per consolidated image"))
                .arg(Arg::new("min_items").long("min-items").help("Minimum items per consolidated image")),
        )
        .subcommand(
            Command::new("rollback")
                .about("Restore installables from their .bak backups")
                .arg(filter_arg())
                .arg(dry_run_arg()),
        )
        .subcommand(
            Command::new("unpack")
                .about("Replace CEFS symlinks with real directories")
                .arg(filter_arg())
                .arg(dry_run_arg())
                .arg(defer_cleanup_arg()),
        )
        .subcommand(
            Command::new("repair")
                .about("Classify and fix interrupted transactions")
                .arg(filter_arg())
                .arg(dry_run_arg())
                .arg(Arg::new("min_age_secs").long("min-age-secs").help("Minimum transaction age")),
        )
        .subcommand(
            Command::new("fsck")
                .about("Check manifests and report stale leftovers")
                .arg(filter_arg()),
        )
        .subcommand(Command::new("usage").about("Report image usage and wasted space"))
}

/// Source revision recorded in manifests
fn emit_git_sha() {
    println!("cargo:rerun-if-env-changed=CEFS_GIT_SHA");
    if env::var("CEFS_GIT_SHA").is_ok() {
        return;
    }

    let output = process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output();
    match output {
        Ok(out) if out.status.success() => {
            let sha = String::from_utf8_lossy(&out.stdout).trim().to_string();
            println!("cargo:rustc-env=CEFS_GIT_SHA={}", sha);
        }
        _ => println!("cargo:warning=git revision unavailable; manifests will record 'unknown'"),
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    emit_git_sha();

    let out_dir = match env::var("OUT_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=OUT_DIR not set: {}", e);
            return;
        }
    };

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = out_dir.join("cefs.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
