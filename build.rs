use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    // Copy the linker fragments into OUT_DIR so cortex-m-rt's link.x can find them
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("cargo sets OUT_DIR"));
    for script in ["memory.x", "device.x"] {
        fs::copy(script, out_dir.join(script)).expect("linker script present");
        println!("cargo:rerun-if-changed={script}");
    }
    println!("cargo:rustc-link-search={}", out_dir.display());
    println!("cargo:rerun-if-changed=build.rs");
}
