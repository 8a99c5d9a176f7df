use chrono::Utc;

fn main() {
    // Stamp the binary so `mural --version` identifies the exact build.
    let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
    println!("cargo:rustc-env=BUILD_TIMESTAMP={stamp}");
    println!("cargo:rerun-if-changed=build.rs");
}
