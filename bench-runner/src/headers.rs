//! C header embedding benchmark modules
//!
//! The firmware links every benchmark in as a byte array from
//! `benchmarks.h`; the build selects one by name.

use crate::discover::{benchmark_name, find_modules};
use anyhow::Context;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Name of the generated header
pub const HEADER_FILE: &str = "benchmarks.h";

/// One `static uint8_t` array definition, 4-byte aligned
pub fn array_definition(name: &str, bytes: &[u8]) -> String {
    let mut body = String::with_capacity(bytes.len() * 6);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            body.push_str(" ,");
        }
        let _ = write!(body, "0x{:x}", byte);
    }
    format!("static uint8_t {name}[] __attribute__((aligned (4))) = {{{body}}};\n")
}

/// Complete header text for the given definitions
pub fn render_header(definitions: &[String]) -> String {
    format!(
        "#ifndef H_BENCHMARKS\n\
         #define H_BENCHMARKS\n\
         #include <stdint.h>\n\
         #pragma GCC diagnostic push\n\
         #pragma GCC diagnostic ignored \"-Wunused-variable\"\n\
         \n\
         {}\n\
         \n\
         #pragma GCC diagnostic pop\n\
         #endif\n",
        definitions.join("\n")
    )
}

/// Embed every `*.wasm` (or `*.aot`) module below `sources` into
/// `out_dir/benchmarks.h`. Returns the header path.
pub fn write_header(sources: &Path, out_dir: &Path, aot: bool) -> anyhow::Result<PathBuf> {
    let extension = if aot { "aot" } else { "wasm" };
    let modules = find_modules(sources, extension)
        .with_context(|| format!("searching {} for *.{}", sources.display(), extension))?;

    let mut definitions = Vec::with_capacity(modules.len());
    for path in &modules {
        let Some(stem) = path.file_stem() else {
            continue;
        };
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        tracing::debug!("Embedding {} ({} bytes)", path.display(), bytes.len());
        definitions.push(array_definition(&benchmark_name(&stem.to_string_lossy()), &bytes));
    }

    let header = out_dir.join(HEADER_FILE);
    std::fs::write(&header, render_header(&definitions))
        .with_context(|| format!("writing {}", header.display()))?;
    tracing::info!("Embedded {} modules into {}", definitions.len(), header.display());
    Ok(header)
}
