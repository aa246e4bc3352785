use std::process::Command;

fn main() {
    let version = env!("CARGO_PKG_VERSION");

    // Compilation timestamp reported in the startup banner
    let timestamp = Command::new("date")
        .args(["+%Y-%m-%d %H:%M:%S UTC"])
        .env("TZ", "UTC")
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    println!("cargo:rustc-env=BUILD_VERSION={}", version);

    if timestamp.is_empty() {
        println!("cargo:rustc-env=BUILD_TIMESTAMP=Unknown");
    } else {
        println!("cargo:rustc-env=BUILD_TIMESTAMP={}", timestamp);
    }
}
