// Build script to compile the deferred pipeline's GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADERS: &[&str] = &[
    "shadow.vert",
    "gbuffer.vert",
    "gbuffer.frag",
    "fullscreen.vert",
    "lighting.frag",
    "composite.frag",
];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    for shader in SHADERS {
        let input = format!("shaders/{shader}");
        let output = format!("shaders/{shader}.spv");
        compile_shader(&input, &output);
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    // Check if glslc is available
    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            // Precompiled .spv files are loaded at runtime, so a failed
            // compile only leaves the previous bytecode in place.
            println!(
                "cargo:warning=Failed to compile {}: exit code {:?}",
                input,
                status.code()
            );
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({e}); shaders not compiled");
            println!("cargo:warning=  glslc {input} -o {output}");
        }
    }
}
