use std::env;
use std::process::Command;

/// Set by packaging builds that have no `.git` (release tarballs, container
/// images) to pin the commit reported by `/health`.
const COMMIT_OVERRIDE: &str = "CONFSYNC_BUILD_COMMIT";

fn main() {
    println!("cargo:rerun-if-env-changed={COMMIT_OVERRIDE}");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/index");

    let commit = env::var(COMMIT_OVERRIDE)
        .ok()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .or_else(git_describe)
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=CONFSYNC_GIT_SHA={commit}");
}

/// Abbreviated commit, suffixed `-dirty` when the work tree has local edits.
fn git_describe() -> Option<String> {
    let out = Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=10", "--exclude", "*"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let commit = String::from_utf8(out.stdout).ok()?.trim().to_string();
    (!commit.is_empty()).then_some(commit)
}
