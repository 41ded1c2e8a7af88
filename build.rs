//! Build script for hieravg
//!
//! Embeds the git revision, build time, target and compiler version so
//! `hieravg version` and the startup log can identify the exact binary
//! running on each node of the tree.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = command_output("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_branch = command_output("git", &["rev-parse", "--abbrev-ref", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(out) if out.status.success() => {
            if out.stdout.is_empty() { "false" } else { "true" }
        }
        _ => "unknown",
    };

    let vars = [
        ("HIERAVG_GIT_HASH", git_hash),
        ("HIERAVG_GIT_BRANCH", git_branch),
        ("HIERAVG_GIT_DIRTY", git_dirty.to_string()),
        (
            "HIERAVG_BUILD_TIMESTAMP",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ),
        ("HIERAVG_TARGET", env_or_unknown("TARGET")),
        ("HIERAVG_PROFILE", env_or_unknown("PROFILE")),
        ("HIERAVG_HOST", env_or_unknown("HOST")),
        ("HIERAVG_RUSTC_VERSION", command_output("rustc", &["--version"])),
    ];

    for (key, value) in &vars {
        println!("cargo:rustc-env={}={}", key, value);
    }
}

/// Trimmed stdout of a command, or "unknown" if it could not be run
fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn env_or_unknown(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| "unknown".to_string())
}
