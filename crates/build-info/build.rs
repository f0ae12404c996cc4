use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

const GIT_HEAD: &str = ".git/HEAD";

fn main() {
    println!("cargo:rerun-if-env-changed=DEVHUB_BUILD_ID_OVERRIDE");
    watch_git_refs();

    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let git_label = describe_head().unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var("DEVHUB_BUILD_ID_OVERRIDE")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("{} | {}", build_time, git_label));

    println!("cargo:rustc-env=DEVHUB_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=DEVHUB_BUILD_TIME={}", build_time);
    println!("cargo:rustc-env=DEVHUB_BUILD_GIT={}", git_label);
}

fn watch_git_refs() {
    let head = Path::new(GIT_HEAD);
    if !head.exists() {
        return;
    }
    println!("cargo:rerun-if-changed={}", GIT_HEAD);

    // Detached heads have no ref to follow.
    let target = fs::read_to_string(head).ok().and_then(|contents| {
        contents
            .strip_prefix("ref: ")
            .map(|reference| format!(".git/{}", reference.trim()))
    });
    if let Some(reference) = target.filter(|path| Path::new(path).exists()) {
        println!("cargo:rerun-if-changed={}", reference);
    }
}

fn describe_head() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!label.is_empty()).then_some(label)
}
