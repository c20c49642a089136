//! Build script for amti-sys.
//!
//! Without the `amti-sdk` feature nothing is linked, so the crate builds on
//! hosts that have no AMTI software installed.

fn main() {
    println!("cargo:rerun-if-env-changed=AMTI_SDK_DIR");

    #[cfg(feature = "amti-sdk")]
    link_sdk();
}

#[cfg(feature = "amti-sdk")]
fn link_sdk() {
    use std::path::PathBuf;

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "windows" {
        println!(
            "cargo:warning=amti-sdk enabled for target '{}'; AMTIUSBDevice.dll only exists on Windows",
            target_os
        );
    }

    let pointer_width = std::env::var("CARGO_CFG_TARGET_POINTER_WIDTH").unwrap_or_default();
    let arch_dir = if pointer_width == "64" { "64bit" } else { "32bit" };

    let sdk_dir = std::env::var("AMTI_SDK_DIR")
        .expect("AMTI_SDK_DIR environment variable must be set when `amti-sdk` feature is enabled.");
    let sdk_dir = PathBuf::from(sdk_dir);

    // Accept either the arch directory itself or its parent
    let lib_dir = if sdk_dir.join(arch_dir).exists() {
        sdk_dir.join(arch_dir)
    } else {
        sdk_dir
    };

    if !lib_dir.join("AMTIUSBDevice.lib").exists() {
        println!(
            "cargo:warning=AMTIUSBDevice.lib not found in {}",
            lib_dir.display()
        );
    }

    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib=dylib=AMTIUSBDevice");
}
