//! Per-run deployment configuration.

use std::path::{Path, PathBuf};

use crate::core::detect::BinaryKind;

/// Everything the orchestrator needs to drive one deployment.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub kind: BinaryKind,
    pub binary_path: PathBuf,
    /// Normalized output root: `<out>/<name>.AppDir` for ELF,
    /// `<out>/<name>.app` for Mach-O, the requested directory for PE.
    pub output_root: PathBuf,
    pub qml_roots: Vec<PathBuf>,
    pub languages: Vec<String>,
    pub overlays: Vec<PathBuf>,
}

impl DeployPlan {
    pub fn new(
        kind: BinaryKind,
        binary_path: PathBuf,
        requested_out: PathBuf,
        qml_roots: Vec<PathBuf>,
        languages: Vec<String>,
        overlays: Vec<PathBuf>,
    ) -> Self {
        let output_root = platform_output_root(kind, &requested_out, &binary_path);
        Self {
            kind,
            binary_path,
            output_root,
            qml_roots,
            languages,
            overlays,
        }
    }
}

/// Append the platform's bundle suffix to the requested output directory
/// unless the caller already supplied one. Windows keeps a flat directory.
pub fn platform_output_root(kind: BinaryKind, requested: &Path, binary_path: &Path) -> PathBuf {
    let base_name = binary_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match kind {
        BinaryKind::Elf => {
            if requested.extension().is_some_and(|e| e == "AppDir") {
                requested.to_path_buf()
            } else {
                requested.join(format!("{base_name}.AppDir"))
            }
        }
        BinaryKind::MachO => {
            if requested.extension().is_some_and(|e| e == "app") {
                requested.to_path_buf()
            } else {
                requested.join(format!("{base_name}.app"))
            }
        }
        BinaryKind::Pe => requested.to_path_buf(),
    }
}
