// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    #[cfg(any(feature = "cuda", feature = "hip"))]
    gpu::build();
}

#[cfg(all(feature = "cuda", feature = "hip"))]
compile_error!("Both 'cuda' and 'hip' features are enabled; only one can be used.");

#[cfg(any(feature = "cuda", feature = "hip"))]
mod gpu {
    use std::env;

    const GPU_FILES: &[&str] = &["src/gpu/grid.cu", "src/gpu/utils.cu"];

    // This code is adapted from pkg-config-rs
    // (https://github.com/rust-lang/pkg-config-rs).
    #[allow(clippy::if_same_then_else, clippy::needless_bool)]
    fn infer_static(name: &str) -> bool {
        if env::var(format!("{}_STATIC", name.to_uppercase())).is_ok() {
            true
        } else if env::var(format!("{}_DYNAMIC", name.to_uppercase())).is_ok() {
            false
        } else if env::var("PKG_CONFIG_ALL_STATIC").is_ok() {
            true
        } else if env::var("PKG_CONFIG_ALL_DYNAMIC").is_ok() {
            false
        } else {
            false
        }
    }

    /// Search for any C/C++/CUDA files and have rerun-if-changed on all of them.
    fn rerun_if_changed_gpu_files<P: AsRef<std::path::Path>>(dir: P) {
        for path in std::fs::read_dir(dir).expect("dir exists") {
            let path = path.expect("is readable").path();
            if path.is_dir() {
                rerun_if_changed_gpu_files(&path)
            }

            if let Some("cu" | "cuh" | "h") = path.extension().and_then(|os_str| os_str.to_str())
            {
                println!("cargo:rerun-if-changed={}", path.display());
            }
        }
    }

    fn debug_define() -> &'static str {
        // The DEBUG env. variable is set by cargo. If running "cargo build
        // --release", DEBUG is "false", otherwise "true". C/C++/CUDA like the
        // compile option "NDEBUG" to be defined when using assert.h, so if
        // appropriate, define that here. We also define "DEBUG" so that can be
        // used.
        match env::var("DEBUG").as_deref() {
            Ok("false") => "NDEBUG",
            _ => "DEBUG",
        }
    }

    #[cfg(feature = "cuda")]
    fn parse_and_validate_compute(c: &str, var: &str) -> Vec<u16> {
        let mut out = vec![];
        for compute in c.trim().split(',') {
            // Check that there's only two numeric characters.
            if compute.len() != 2 {
                panic!("When parsing {var}, found '{compute}', which is not a two-digit number!")
            }

            match compute.parse() {
                Ok(p) => out.push(p),
                Err(_) => panic!("'{compute}', part of {var}, couldn't be parsed into a number!"),
            }
        }
        out
    }

    #[cfg(feature = "cuda")]
    pub(super) fn build() {
        // Double-precision atomicAdd needs compute capability 6.0.
        const DEFAULT_CUDA_ARCHES: &[u16] = &[60, 70, 80];
        const DEFAULT_CUDA_SMS: &[u16] = &[60, 61, 70, 75, 80, 86];

        println!("cargo:rerun-if-env-changed=HYPERGRID_CUDA_COMPUTE");
        let (arches, sms): (Vec<u16>, Vec<u16>) = match env::var("HYPERGRID_CUDA_COMPUTE") {
            // When a user-supplied variable exists, use it as the CUDA arch and
            // compute level.
            Ok(c) => {
                let compute = parse_and_validate_compute(&c, "HYPERGRID_CUDA_COMPUTE");
                if let Some(too_old) = compute.iter().find(|&&c| c < 60) {
                    panic!("HYPERGRID_CUDA_COMPUTE includes {too_old}, but at least 60 is needed");
                }
                let sms = compute.clone();
                (compute, sms)
            }
            Err(_) => {
                // Print out all of the default arches and computes as a
                // warning.
                println!("cargo:warning=No HYPERGRID_CUDA_COMPUTE; Passing arch=compute_{DEFAULT_CUDA_ARCHES:?} and code=sm_{DEFAULT_CUDA_SMS:?} to nvcc");
                (DEFAULT_CUDA_ARCHES.to_vec(), DEFAULT_CUDA_SMS.to_vec())
            }
        };

        rerun_if_changed_gpu_files("src/gpu/");

        let mut cuda_target = cc::Build::new();
        cuda_target
            .cuda(true)
            .cudart("shared") // We handle linking cudart statically
            .include("src/gpu/")
            .define(debug_define(), None);

        // Loop over each arch and sm
        for arch in arches {
            for &sm in &sms {
                if sm < arch {
                    continue;
                }

                cuda_target.flag("-gencode");
                cuda_target.flag(&format!("arch=compute_{arch},code=sm_{sm}"));
            }
        }

        cuda_target.files(GPU_FILES).compile("hypergrid_gpu");

        // Link CUDA. If the library path manually specified, search there.
        if let Ok(lib_dir) = env::var("CUDA_LIB") {
            println!("cargo:rustc-link-search=native={lib_dir}");
        }

        if infer_static("cuda") {
            // CUDA ships its static library as cudart_static.a, not cudart.a
            println!("cargo:rustc-link-lib=static=cudart_static");
        } else {
            println!("cargo:rustc-link-lib=cudart");
        }
    }

    #[cfg(feature = "hip")]
    pub(super) fn build() {
        println!("cargo:rerun-if-env-changed=HIP_PATH");
        println!("cargo:rerun-if-env-changed=HYPERGRID_HIP_ARCH");
        let hip_path = env::var("HIP_PATH").unwrap_or_else(|_| "/opt/rocm".to_string());

        rerun_if_changed_gpu_files("src/gpu/");

        let mut hip_target = cc::Build::new();
        hip_target
            .compiler(format!("{hip_path}/bin/hipcc"))
            .cpp(true)
            .include("src/gpu/")
            .define(debug_define(), None)
            .flag("-xhip");
        if let Ok(arches) = env::var("HYPERGRID_HIP_ARCH") {
            for arch in arches.trim().split(',') {
                hip_target.flag(&format!("--offload-arch={arch}"));
            }
        }
        hip_target.files(GPU_FILES).compile("hypergrid_gpu");

        println!("cargo:rustc-link-search=native={hip_path}/lib");
        if infer_static("hip") {
            println!("cargo:rustc-link-lib=static=amdhip64");
        } else {
            println!("cargo:rustc-link-lib=amdhip64");
        }
    }
}
