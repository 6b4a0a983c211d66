use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

const SSE_PORT_PLACEHOLDER: &str = "{{SSE_PORT}}";

/// `git describe` output, or the crate version outside a checkout
fn git_version() -> String {
    Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| env::var("CARGO_PKG_VERSION").expect("CARGO_PKG_VERSION is always set"))
}

/// Write the control page as the halves around the SSE port placeholder,
/// so the web server can stream it without formatting at runtime.
fn split_control_page(out_dir: &Path) {
    println!("cargo:rerun-if-changed=src/index.html");
    let html = fs::read_to_string("src/index.html").expect("Failed to read src/index.html");

    let Some((start, end)) = html.split_once(SSE_PORT_PLACEHOLDER) else {
        panic!("src/index.html has no {SSE_PORT_PLACEHOLDER} placeholder");
    };
    assert!(
        !end.contains(SSE_PORT_PLACEHOLDER),
        "src/index.html must contain exactly one {SSE_PORT_PLACEHOLDER} placeholder"
    );

    fs::write(out_dir.join("index_start.html"), start).expect("Failed to write index_start.html");
    fs::write(out_dir.join("index_end.html"), end).expect("Failed to write index_end.html");
}

fn main() {
    embuild::espidf::sysenv::output();

    println!("cargo:rustc-env=GIT_VERSION={}", git_version());
    // Rebuild when HEAD moves or tags change
    println!("cargo:rerun-if-changed=../.git/HEAD");
    println!("cargo:rerun-if-changed=../.git/refs/tags");

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR is set for build scripts");
    split_control_page(Path::new(&out_dir));
}
