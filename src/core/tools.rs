//! Required external helper tools per target format.

use std::path::Path;

use crate::core::detect::BinaryKind;

pub const QTPATHS: &str = "qtpaths";
pub const QML_IMPORT_SCANNER: &str = "qmlimportscanner";
pub const LCONVERT: &str = "lconvert";
pub const ELF_OBJDUMP: &str = "objdump";
pub const PATCHELF: &str = "patchelf";
pub const PE_OBJDUMP: &str = "x86_64-w64-mingw32-objdump";
pub const OTOOL: &str = "llvm-otool";
pub const INSTALL_NAME_TOOL: &str = "llvm-install-name-tool";

/// The qtpaths program to invoke, honoring the `QTPATHS_BIN` override.
pub fn qtpaths_program() -> String {
    std::env::var("QTPATHS_BIN")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| QTPATHS.to_string())
}

/// Names of required helper tools not available for the given target.
///
/// An empty result is the precondition for deployment; the caller aborts
/// with exit code 2 otherwise.
pub fn missing_tools(kind: BinaryKind) -> Vec<String> {
    let mut missing = Vec::new();

    let qtpaths_override = std::env::var("QTPATHS_BIN").unwrap_or_default();
    let have_qtpaths = if qtpaths_override.is_empty() {
        on_path(QTPATHS)
    } else {
        is_invocable_file(Path::new(&qtpaths_override))
    };
    if !have_qtpaths {
        missing.push(if qtpaths_override.is_empty() {
            QTPATHS.to_string()
        } else {
            format!("{qtpaths_override} (from QTPATHS_BIN)")
        });
    }

    for tool in [QML_IMPORT_SCANNER, LCONVERT] {
        if !on_path(tool) {
            missing.push(tool.to_string());
        }
    }

    let format_tools: &[&str] = match kind {
        BinaryKind::Elf => &[ELF_OBJDUMP, PATCHELF],
        BinaryKind::Pe => &[PE_OBJDUMP],
        BinaryKind::MachO => &[OTOOL, INSTALL_NAME_TOOL],
    };
    for tool in format_tools {
        if !on_path(tool) {
            missing.push((*tool).to_string());
        }
    }

    missing
}

fn on_path(name: &str) -> bool {
    which::which(name).is_ok()
}

fn is_invocable_file(path: &Path) -> bool {
    path.is_file() || path.is_symlink()
}
