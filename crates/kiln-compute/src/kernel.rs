//! Kernel files and the fixed binding layout.
//!
//! Kernels are opaque to the lifecycle: they are read from disk by a fixed
//! name per backend and handed to the backend's compiler. The only contract
//! is [`BINDING_LAYOUT`]: slot 0 is the source image (read), slot 1 the
//! destination image (write).
//!
//! | backend  | files tried in order                | entry   |
//! |----------|-------------------------------------|---------|
//! | explicit | `image.spv`, `image_explicit.wgsl`   | `main`  |
//! | raster   | `image.wgsl`                         | `main`  |
//! | stream   | `image.cl`                           | `image` |

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::backend::BackendKind;
use crate::{ComputeError, ComputeResult};

/// SPIR-V module magic number (little-endian word 0).
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// How the kernel uses a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingAccess {
    Read,
    Write,
}

/// One slot of the binding layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub slot: u32,
    pub access: BindingAccess,
    pub name: &'static str,
}

/// Source storage image at 0, destination storage image at 1.
pub const BINDING_LAYOUT: [Binding; 2] = [
    Binding {
        slot: 0,
        access: BindingAccess::Read,
        name: "src",
    },
    Binding {
        slot: 1,
        access: BindingAccess::Write,
        name: "dst",
    },
];

/// Kernel file names tried for `kind`, in order.
pub fn candidates(kind: BackendKind) -> &'static [&'static str] {
    match kind {
        BackendKind::Explicit => &["image.spv", "image_explicit.wgsl"],
        BackendKind::RasterCompute => &["image.wgsl"],
        BackendKind::Stream => &["image.cl"],
    }
}

/// Entry point name the kernel must export.
pub fn entry_point(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Stream => "image",
        BackendKind::RasterCompute | BackendKind::Explicit => "main",
    }
}

/// Loaded kernel program.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelSource {
    /// Source text (WGSL or OpenCL C).
    Text { path: PathBuf, source: String },
    /// SPIR-V words.
    SpirV { path: PathBuf, words: Vec<u32> },
}

impl KernelSource {
    /// Loads the first existing kernel for `kind` from `dir`.
    pub fn load(kind: BackendKind, dir: &Path) -> ComputeResult<Self> {
        let names = candidates(kind);
        for name in names {
            let path = dir.join(name);
            if path.is_file() {
                return Self::from_file(&path);
            }
        }
        Err(ComputeError::CompileOrLink(format!(
            "no {} kernel in {} (looked for {})",
            kind.api_name(),
            dir.display(),
            names.join(", ")
        )))
    }

    /// Reads one kernel file. SPIR-V is recognised by its magic number.
    pub fn from_file(path: &Path) -> ComputeResult<Self> {
        let bytes = fs::read(path).map_err(|e| read_error(path, e))?;
        let kernel = match spirv_words(&bytes) {
            Some(words) => Self::SpirV {
                path: path.to_path_buf(),
                words: words?,
            },
            None => Self::Text {
                path: path.to_path_buf(),
                source: String::from_utf8(bytes).map_err(|e| {
                    ComputeError::CompileOrLink(format!("{}: not valid UTF-8: {e}", path.display()))
                })?,
            },
        };
        debug!(path = %path.display(), spirv = kernel.is_spirv(), "kernel loaded");
        Ok(kernel)
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Text { path, .. } | Self::SpirV { path, .. } => path,
        }
    }

    pub fn is_spirv(&self) -> bool {
        matches!(self, Self::SpirV { .. })
    }
}

fn read_error(path: &Path, e: io::Error) -> ComputeError {
    ComputeError::CompileOrLink(format!("cannot read {}: {e}", path.display()))
}

/// `None` when `bytes` is not SPIR-V; otherwise the decoded words.
fn spirv_words(bytes: &[u8]) -> Option<ComputeResult<Vec<u32>>> {
    let head: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    let big_endian = if u32::from_le_bytes(head) == SPIRV_MAGIC {
        false
    } else if u32::from_be_bytes(head) == SPIRV_MAGIC {
        true
    } else {
        return None;
    };

    if bytes.len() % 4 != 0 {
        return Some(Err(ComputeError::CompileOrLink(format!(
            "SPIR-V length {} is not a multiple of 4",
            bytes.len()
        ))));
    }
    let words = bytes
        .chunks_exact(4)
        .map(|w| {
            let w = [w[0], w[1], w[2], w[3]];
            if big_endian { u32::from_be_bytes(w) } else { u32::from_le_bytes(w) }
        })
        .collect();
    Some(Ok(words))
}
