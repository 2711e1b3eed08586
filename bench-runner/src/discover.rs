//! Benchmark discovery

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// C identifier used for a benchmark file stem
pub fn benchmark_name(stem: &str) -> String {
    stem.replace('-', "_")
}

/// All files below `root` with the given extension, sorted by path
pub fn find_modules(root: &Path, extension: &str) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == extension)
        {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Names of all `*.wasm` benchmarks below `root`, sorted and deduplicated
pub fn discover_benchmarks(root: &Path) -> anyhow::Result<Vec<String>> {
    let mut names: Vec<String> = find_modules(root, "wasm")?
        .iter()
        .filter_map(|path| path.file_stem())
        .map(|stem| benchmark_name(&stem.to_string_lossy()))
        .collect();
    names.sort();
    names.dedup();
    tracing::debug!("Discovered {} benchmarks in {}", names.len(), root.display());
    Ok(names)
}

/// Benchmarks to run: the explicit selection if any, otherwise all found
pub fn select_benchmarks(root: &Path, explicit: &[String]) -> anyhow::Result<Vec<String>> {
    if explicit.is_empty() {
        return discover_benchmarks(root);
    }
    Ok(explicit.iter().map(|name| benchmark_name(name)).collect())
}
