//! Firmware build driver
//!
//! Builds one benchmark image per pass with CMake and make, then reads its
//! section sizes with `size`.

use crate::{HarnessError, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;

/// First row of Berkeley `size` output that starts with text, data, bss, dec
static SIZE_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(\d+)[ \t]+(\d+)[ \t]+(\d+)[ \t]+(\d+)")
        .expect("static regex must compile")
});

/// Options selecting the firmware variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildFlags {
    /// Wrap the allocator and stream heap events over the trace channel
    pub heap_trace: bool,
    /// Embed ahead-of-time compiled modules instead of wasm bytecode
    pub aot: bool,
    /// Build the Embench harness instead of CoreMark
    pub embench: bool,
}

impl BuildFlags {
    /// Extra `-D` definitions passed to CMake
    pub fn cmake_defines(&self) -> Vec<&'static str> {
        let mut defines = Vec::new();
        if self.heap_trace {
            defines.push("-DHEAP_TRACE=1");
        }
        if self.aot {
            defines.push("-DAOT=1");
        }
        if self.embench {
            defines.push("-DEMBENCH=1");
        }
        defines
    }
}

/// Section sizes of a linked image, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageSize {
    pub text: u64,
    pub data: u64,
    pub bss: u64,
}

impl ImageSize {
    /// Parse Berkeley-format `size` output.
    ///
    /// ```text
    ///    text    data     bss     dec     hex filename
    ///  183724    2364   97816  283904   45500 wamr
    /// ```
    pub fn parse(output: &str) -> Result<Self> {
        let invalid = || HarnessError::SizeOutput(output.to_string());
        let caps = SIZE_ROW.captures(output).ok_or_else(invalid)?;
        let field = |i: usize| caps[i].parse::<u64>().map_err(|_| invalid());

        Ok(Self {
            text: field(1)?,
            data: field(2)?,
            bss: field(3)?,
        })
    }

    /// RAM reserved statically: initialised plus zeroed data
    pub fn static_data(&self) -> u64 {
        self.data + self.bss
    }
}

/// Result of a successful build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    /// Linked ELF image
    pub path: PathBuf,
    /// Section sizes
    pub size: ImageSize,
    /// SHA-256 of the image, hex encoded
    pub sha256: String,
}

/// Builds benchmark firmware images
#[allow(async_fn_in_trait)]
pub trait BuildDriver {
    /// Remove everything left by the previous build
    async fn clean(&self) -> Result<()>;

    /// Configure and build `benchmark` with the given variant
    async fn configure_and_build(&self, benchmark: &str, flags: &BuildFlags) -> Result<BuiltImage>;
}

/// CMake project built out of tree in a dedicated directory
#[derive(Debug, Clone)]
pub struct CmakeBuild {
    /// Build directory; the project is its parent
    pub build_dir: PathBuf,
    /// Name of the linked image inside the build directory
    pub image_name: String,
    /// Berkeley `size` tool
    pub size_tool: PathBuf,
}

impl CmakeBuild {
    /// Create a build driver
    pub fn new(build_dir: impl Into<PathBuf>, image_name: impl Into<String>) -> Self {
        Self {
            build_dir: build_dir.into(),
            image_name: image_name.into(),
            size_tool: PathBuf::from("size"),
        }
    }

    /// Path of the linked image
    pub fn image_path(&self) -> PathBuf {
        self.build_dir.join(&self.image_name)
    }

    async fn run_quiet(&self, program: &str, args: &[&str]) -> Result<()> {
        tracing::debug!("Running {} {}", program, args.join(" "));
        let status = Command::new(program)
            .args(args)
            .current_dir(&self.build_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| HarnessError::Spawn {
                tool: program.to_string(),
                source,
            })?;

        if !status.success() {
            return Err(HarnessError::ToolFailed {
                tool: program.to_string(),
                status: status.to_string(),
            });
        }
        Ok(())
    }

    async fn read_size(&self) -> Result<ImageSize> {
        let tool = self.size_tool.display().to_string();
        let output = Command::new(&self.size_tool)
            .arg(&self.image_name)
            .current_dir(&self.build_dir)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|source| HarnessError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(HarnessError::ToolFailed {
                tool,
                status: output.status.to_string(),
            });
        }
        ImageSize::parse(&String::from_utf8_lossy(&output.stdout))
    }
}

impl BuildDriver for CmakeBuild {
    async fn clean(&self) -> Result<()> {
        clear_dir(&self.build_dir).await
    }

    async fn configure_and_build(&self, benchmark: &str, flags: &BuildFlags) -> Result<BuiltImage> {
        tracing::info!("Building {} ({:?})", benchmark, flags);

        let define = format!("-DBENCHMARK={}", benchmark);
        let mut args = vec!["..", define.as_str(), "-DCMAKE_BUILD_TYPE=Release"];
        args.extend(flags.cmake_defines());
        self.run_quiet("cmake", &args).await?;
        self.run_quiet("make", &[]).await?;

        let size = self.read_size().await?;
        let path = self.image_path();
        let sha256 = image_sha256(&path).await?;

        tracing::info!(
            "{} size: text = {}, data = {}",
            benchmark,
            size.text,
            size.static_data()
        );
        tracing::debug!("{} sha256 {}", path.display(), sha256);
        Ok(BuiltImage { path, size, sha256 })
    }
}

/// Delete the contents of `dir`, creating it if missing
pub async fn clear_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| HarnessError::io(format!("creating {}", dir.display()), e))?;

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| HarnessError::io(format!("listing {}", dir.display()), e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| HarnessError::io(format!("listing {}", dir.display()), e))?
    {
        let path = entry.path();
        tracing::debug!("Removing {}", path.display());
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| HarnessError::io(format!("inspecting {}", path.display()), e))?;
        let removed = if file_type.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(|e| HarnessError::io(format!("removing {}", path.display()), e))?;
    }
    Ok(())
}

/// SHA-256 of a file, hex encoded
async fn image_sha256(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| HarnessError::io(format!("reading {}", path.display()), e))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_output() {
        let output = "   text\t   data\t    bss\t    dec\t    hex\tfilename\n \
                      183724\t   2364\t  97816\t 283904\t  45500\twamr\n";
        let size = ImageSize::parse(output).unwrap();

        assert_eq!(size.text, 183724);
        assert_eq!(size.data, 2364);
        assert_eq!(size.bss, 97816);
        assert_eq!(size.static_data(), 100180);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        let err = ImageSize::parse("size: 'wamr': No such file\n").unwrap_err();
        assert!(matches!(err, HarnessError::SizeOutput(_)));
    }

    #[test]
    fn test_parse_size_skips_to_numeric_row() {
        // Header words never match, even when a filename is numeric
        let output = "text data bss dec hex filename\n   10   20   30   60   3c   1234\n";
        let size = ImageSize::parse(output).unwrap();
        assert_eq!((size.text, size.data, size.bss), (10, 20, 30));

        // Three numbers are not a size row
        assert!(ImageSize::parse("10 20 30\n").is_err());
    }

    #[test]
    fn test_cmake_defines() {
        let flags = BuildFlags {
            heap_trace: true,
            aot: false,
            embench: true,
        };
        assert_eq!(flags.cmake_defines(), vec!["-DHEAP_TRACE=1", "-DEMBENCH=1"]);
        assert!(BuildFlags::default().cmake_defines().is_empty());
    }

    #[test]
    fn test_image_path() {
        let build = CmakeBuild::new("./build", "wasm3int");
        assert_eq!(build.image_path(), PathBuf::from("./build/wasm3int"));
    }

    #[tokio::test]
    async fn test_clear_dir_removes_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("CMakeCache.txt"), "x").unwrap();
        std::fs::create_dir_all(dir.path().join("CMakeFiles/sub")).unwrap();
        std::fs::write(dir.path().join("CMakeFiles/sub/a.o"), "y").unwrap();

        clear_dir(dir.path()).await.unwrap();

        assert!(dir.path().exists(), "Build directory itself must stay");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_clear_dir_creates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");

        clear_dir(&build).await.unwrap();
        assert!(build.is_dir());
    }
}
