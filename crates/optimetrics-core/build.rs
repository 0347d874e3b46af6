use std::env;
use std::process::Command;

/// Runs git in the workspace and returns its trimmed output.
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    // Packagers building outside a checkout pass the revision in
    let revision = env::var("OPTIMETRICS_BUILD_REVISION")
        .ok()
        .filter(|r| !r.is_empty())
        .or_else(|| git(&["describe", "--always", "--dirty", "--abbrev=8"]))
        .unwrap_or_else(|| "unknown".into());
    let commit_date = git(&["log", "-1", "--format=%cs"]).unwrap_or_else(|| "unknown".into());

    println!("cargo:rustc-env=OPTIMETRICS_BUILD_REVISION={revision}");
    println!("cargo:rustc-env=OPTIMETRICS_COMMIT_DATE={commit_date}");

    println!("cargo:rerun-if-env-changed=OPTIMETRICS_BUILD_REVISION");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/refs/");
    println!("cargo:rerun-if-changed=../../.git/index");
}
