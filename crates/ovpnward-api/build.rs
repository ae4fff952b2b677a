use std::path::Path;
use std::process::Command;

fn git_version() -> String {
    Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
}

// PROFILE only ever reports "debug" or "release"; custom profiles show up as a
// directory component of OUT_DIR (target/<profile>/build/...).
fn is_distribute_build() -> bool {
    std::env::var("OUT_DIR")
        .map(|dir| Path::new(&dir).components().any(|c| c.as_os_str() == "distribute"))
        .unwrap_or(false)
}

fn main() {
    println!("cargo:rustc-env=GIT_VERSION={}", git_version());
    println!("cargo::rustc-check-cfg=cfg(distribute)");

    if is_distribute_build() {
        println!("cargo:rustc-cfg=distribute");
    }

    println!("cargo:rerun-if-changed=.git/HEAD");
}
