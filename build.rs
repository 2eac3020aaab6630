//! Stamps the binary with the commit and build time reported by `/version`.

use std::process::Command;

fn git_short_hash() -> Option<String> {
    let out = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())?;
    let hash = String::from_utf8(out.stdout).ok()?;
    Some(hash.trim().to_owned())
}

fn main() {
    let commit = git_short_hash().unwrap_or_else(|| "unknown".into());
    let built_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    println!("cargo:rustc-env=GIT_COMMIT_SHORT={commit}");
    println!("cargo:rustc-env=BUILD_TIMESTAMP={built_at}");
    for watched in [".git/HEAD", ".git/refs/heads/"] {
        println!("cargo:rerun-if-changed={watched}");
    }
}
