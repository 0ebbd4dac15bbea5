use std::{
    env,
    path::{Path, PathBuf},
};

const ROOT: &str = env!("CARGO_MANIFEST_DIR");

fn make_builder() -> bindgen::Builder {
    bindgen::builder()
        .raw_line("#![allow(dead_code)]")
        .raw_line("#![allow(non_camel_case_types)]")
        .raw_line("#![allow(non_snake_case)]")
        .raw_line("#![allow(non_upper_case_globals)]")
        .raw_line("#![allow(unused_imports)]")
        .default_enum_style(bindgen::EnumVariation::Rust {
            non_exhaustive: true,
        })
        .derive_partialeq(true)
        .derive_default(true)
}

fn write(builder: bindgen::Builder, path: &str) {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    builder
        .generate()
        .unwrap()
        .write_to_file(out_dir.join(path))
        .unwrap();
}

/// SDK roots come from the environment first, then the vendored `sdk/` layout.
fn sdk_root(var: &str, vendored: &str) -> Option<PathBuf> {
    println!("cargo::rerun-if-env-changed={var}");
    env::var_os(var)
        .map(PathBuf::from)
        .or_else(|| Some(Path::new(ROOT).join("sdk").join(vendored)))
        .filter(|path| path.exists())
}

fn main() {
    println!("cargo::rerun-if-changed=build.rs");
    println!("cargo::rerun-if-changed=src/wrappers/nvenc.h");
    println!("cargo::rustc-check-cfg=cfg(nvidia_sys_stub)");

    let (Some(cuda_sdk), Some(nvc_sdk)) = (
        sdk_root("CUDA_PATH", "cuda"),
        sdk_root("NVIDIA_VIDEO_CODEC_SDK", "nvidia_video_codec"),
    ) else {
        println!("cargo::warning=CUDA or Video Codec SDK not found; building nvidia_sys in stub mode");
        println!("cargo::rustc-cfg=nvidia_sys_stub");
        return;
    };

    let cuda_include = cuda_sdk.join("include");
    let cuda_cl_arg = format!("-I{}", cuda_include.to_string_lossy());
    let cuda_lib = if cfg!(target_os = "windows") {
        cuda_sdk.join("lib").join("x64")
    } else {
        cuda_sdk.join("lib64")
    };
    println!("cargo::rustc-link-search={}", cuda_lib.to_string_lossy());
    println!("cargo::rustc-link-lib=cuda");

    let nvc_include = nvc_sdk.join("Interface");
    let nvc_cl_arg = format!("-I{}", nvc_include.to_string_lossy());
    if cfg!(target_os = "windows") {
        println!(
            "cargo::rustc-link-search={}",
            nvc_sdk.join("Lib").join("x64").to_string_lossy()
        );
        println!("cargo::rustc-link-lib=nvencodeapi");
    } else {
        println!(
            "cargo::rustc-link-search={}",
            nvc_sdk.join("Lib").join("linux").join("stubs").join("x86_64").to_string_lossy()
        );
        println!("cargo::rustc-link-lib=nvidia-encode");
    }

    write(
        make_builder()
            .clang_arg(&cuda_cl_arg)
            .header(cuda_include.join("cuda.h").to_string_lossy()),
        "cuda.rs",
    );

    write(
        make_builder()
            .clang_arg(&nvc_cl_arg)
            .clang_arg(&cuda_cl_arg)
            .header(format!("{ROOT}/src/wrappers/nvenc.h"))
            .allowlist_file(".*[/\\\\]nvenc.h")
            .allowlist_file(".*[/\\\\]nvEncodeAPI.h"),
        "nvencodeapi.rs",
    );
}
