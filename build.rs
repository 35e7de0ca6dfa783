//! Build script for graf-rt
//!
//! Tracks the kernel source and, with the `opencl` feature, points the linker
//! at an OpenCL SDK when one is installed outside the default search path.

use std::env;
use std::path::{Path, PathBuf};

const KERNEL_SOURCE: &str = "src/kernels/system.cl";

/// Environment variables naming an OpenCL SDK root, in lookup order.
const SDK_VARS: &[&str] = &["OPENCL_LIB_DIR", "OCL_ROOT", "CUDA_PATH", "INTELOCLSDKROOT"];

fn main() {
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_else(|_| "linux".to_string());
    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_else(|_| "x86_64".to_string());
    let use_opencl = env::var("CARGO_FEATURE_OPENCL").is_ok();

    if use_opencl {
        match find_opencl_lib_dir(&target_os, &target_arch) {
            Some(dir) => {
                println!("cargo:rustc-link-search=native={}", dir.display());
                println!("cargo:opencl_lib_dir={}", dir.display());
            }
            // macOS links the OpenCL framework; elsewhere the ICD loader is
            // usually on the system path already
            None if target_os != "macos" => {
                println!("cargo:warning=No OpenCL SDK found via {}; relying on the system linker path", SDK_VARS.join(", "));
            }
            None => {}
        }
    }

    // Rerun if these change
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed={}", KERNEL_SOURCE);
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_OPENCL");
    for var in SDK_VARS {
        println!("cargo:rerun-if-env-changed={}", var);
    }
}

fn find_opencl_lib_dir(target_os: &str, target_arch: &str) -> Option<PathBuf> {
    SDK_VARS.iter().find_map(|var| {
        let root = PathBuf::from(env::var(var).ok()?);
        // OPENCL_LIB_DIR names the library directory itself
        if *var == "OPENCL_LIB_DIR" {
            return root.exists().then_some(root);
        }
        lib_subdirs(target_os, target_arch)
            .iter()
            .map(|sub| root.join(sub))
            .find(|dir| has_opencl_lib(dir, target_os))
    })
}

fn lib_subdirs(target_os: &str, target_arch: &str) -> &'static [&'static str] {
    match (target_os, target_arch) {
        ("windows", "x86_64") => &["lib/x64", "lib/x86_64", "lib"],
        ("windows", _) => &["lib/x86", "lib"],
        (_, "x86_64") => &["lib64", "lib/x86_64", "lib/x64", "lib"],
        _ => &["lib", "lib64"],
    }
}

fn has_opencl_lib(dir: &Path, target_os: &str) -> bool {
    let name = match target_os {
        "windows" => "OpenCL.lib",
        "macos" => "libOpenCL.dylib",
        _ => "libOpenCL.so",
    };
    dir.join(name).exists()
}
