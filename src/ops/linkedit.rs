//! Post-staging link editing.
//!
//! Rewrites runtime search paths so the staged tree is relocatable:
//! RUNPATH entries via `patchelf` on ELF, rpaths and install-names via
//! `llvm-install-name-tool` on Mach-O. A failed edit is a warning, not a
//! fatal error; the affected binary is left as copied.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::core::parse;
use crate::core::plan::DeployPlan;
use crate::core::tools::{INSTALL_NAME_TOOL, PATCHELF};
use crate::io::command::run_tool;

/// RUNPATH of the staged main executable, relative to `usr/bin/`.
pub const ELF_MAIN_RUNPATH: &str = "$ORIGIN/../lib";
/// RUNPATH of staged plugins, reflecting the `usr/plugins/<category>/`
/// nesting depth.
pub const ELF_PLUGIN_RUNPATH: &str = "$ORIGIN/../../lib";
/// Rpath added to the staged main executable.
pub const MACHO_MAIN_RPATH: &str = "@executable_path/../Frameworks";
/// Rpath added to staged plugin dylibs under `Contents/PlugIns/<category>/`.
pub const MACHO_PLUGIN_RPATH: &str = "@loader_path/../../Frameworks";

fn run_link_editor(program: &str, args: &[&OsStr], subject: &Path) -> bool {
    match run_tool(program, args) {
        Ok(out) if out.success => true,
        Ok(out) => {
            eprintln!(
                "Warning: {program} failed on {}: {}",
                subject.display(),
                out.stderr.trim()
            );
            false
        }
        Err(err) => {
            eprintln!("Warning: failed to run {program} on {}: {err}", subject.display());
            false
        }
    }
}

pub fn set_elf_runpath(binary: &Path, runpath: &str) -> bool {
    run_link_editor(
        PATCHELF,
        &[
            OsStr::new("--set-rpath"),
            OsStr::new(runpath),
            binary.as_os_str(),
        ],
        binary,
    )
}

/// Rewrite the RUNPATH of every shared object staged under `usr/plugins/`.
pub fn apply_elf_plugin_runpaths(plan: &DeployPlan) {
    let plugins_dir = plan.output_root.join("usr/plugins");
    for entry in WalkDir::new(&plugins_dir).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.contains(".so") {
            set_elf_runpath(entry.path(), ELF_PLUGIN_RUNPATH);
        }
    }
}

pub fn add_macho_rpath(binary: &Path, rpath: &str) -> bool {
    run_link_editor(
        INSTALL_NAME_TOOL,
        &[
            OsStr::new("-add_rpath"),
            OsStr::new(rpath),
            binary.as_os_str(),
        ],
        binary,
    )
}

/// Give every plugin dylib under `Contents/PlugIns/` an rpath back into the
/// bundle's framework directory.
pub fn add_macho_plugin_rpaths(plan: &DeployPlan) {
    let plugins_dir = plan.output_root.join("Contents/PlugIns");
    for entry in WalkDir::new(&plugins_dir).into_iter().flatten() {
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|e| e == "dylib")
        {
            add_macho_rpath(entry.path(), MACHO_PLUGIN_RPATH);
        }
    }
}

fn set_macho_id(binary: &Path, id: &str) -> bool {
    run_link_editor(
        INSTALL_NAME_TOOL,
        &[OsStr::new("-id"), OsStr::new(id), binary.as_os_str()],
        binary,
    )
}

fn change_macho_dep(binary: &Path, old: &str, new: &str) -> bool {
    run_link_editor(
        INSTALL_NAME_TOOL,
        &[
            OsStr::new("-change"),
            OsStr::new(old),
            OsStr::new(new),
            binary.as_os_str(),
        ],
        binary,
    )
}

/// Full install-name fixup pass over the staged bundle, run last so it
/// observes the complete staged graph including QML plugin dependencies.
///
/// Every binary under `Frameworks/` has its install-id set to the canonical
/// `@rpath/<Name>.framework/Versions/<V>/<Name>` form; then every staged
/// binary's imports that point into `Frameworks/` are rewritten to the same
/// form computed from the dependency's staged location.
pub fn fix_install_names_macho(plan: &DeployPlan) {
    let bundle = &plan.output_root;
    let macos_dir = bundle.join("Contents/MacOS");
    let frameworks_dir = bundle.join("Contents/Frameworks");
    let plugins_dir = bundle.join("Contents/PlugIns");

    let mut binaries: BTreeSet<PathBuf> = BTreeSet::new();

    if let Ok(entries) = fs::read_dir(&macos_dir) {
        for entry in entries.flatten() {
            if entry.path().is_file() {
                binaries.insert(entry.path());
            }
        }
    }
    for entry in WalkDir::new(&frameworks_dir).into_iter().flatten() {
        let path = entry.path();
        if entry.file_type().is_dir() && path.extension().is_some_and(|e| e == "framework") {
            if let Some(bin) = find_framework_binary(path) {
                binaries.insert(bin);
            }
        } else if entry.file_type().is_file()
            && path.extension().is_some_and(|e| e == "dylib")
        {
            binaries.insert(path.to_path_buf());
        }
    }
    for entry in WalkDir::new(&plugins_dir).into_iter().flatten() {
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|e| e == "dylib")
        {
            binaries.insert(entry.path().to_path_buf());
        }
    }

    for binary in &binaries {
        if path_within(binary, &frameworks_dir) {
            let id = framework_install_name(binary, bundle);
            tracing::debug!("set id {id} on {}", binary.display());
            set_macho_id(binary, &id);
        }
    }

    for binary in &binaries {
        let (_, deps) = parse::macho_id_and_deps(binary);
        for dep in deps {
            let dep_path = Path::new(&dep);
            if path_within(dep_path, &frameworks_dir) {
                let reference = framework_install_name(dep_path, bundle);
                tracing::debug!("rewrite {dep} -> {reference} in {}", binary.display());
                change_macho_dep(binary, &dep, &reference);
            }
        }
    }
}

fn path_within(path: &Path, prefix: &Path) -> bool {
    let prefix = parse::canonical_path(prefix);
    if prefix.as_os_str().is_empty() {
        return false;
    }
    parse::canonical_path(path).starts_with(&prefix)
}

/// The canonical in-bundle install name for a binary staged under
/// `Contents/Frameworks/`: `@rpath/<Name>.framework/Versions/<V>/<Name>`
/// for framework binaries, `@rpath/<file>` for loose dylibs.
fn framework_install_name(binary: &Path, bundle_root: &Path) -> String {
    let rel = binary.strip_prefix(bundle_root).unwrap_or(binary);
    let comps: Vec<String> = rel
        .iter()
        .map(|c| c.to_string_lossy().into_owned())
        .collect();

    if let Some(fw_dir_idx) = comps.iter().position(|c| c == "Frameworks") {
        if let Some(offset) = comps[fw_dir_idx + 1..]
            .iter()
            .position(|c| c.ends_with(".framework"))
        {
            let bundle_idx = fw_dir_idx + 1 + offset;
            let name = comps[bundle_idx]
                .strip_suffix(".framework")
                .unwrap_or(&comps[bundle_idx])
                .to_string();
            let mut version = String::from("A");
            if let Some(v_offset) = comps[bundle_idx + 1..].iter().position(|c| c == "Versions") {
                let versions_idx = bundle_idx + 1 + v_offset;
                // The version component is only meaningful with a binary
                // component after it.
                if versions_idx + 2 < comps.len() {
                    version = comps[versions_idx + 1].clone();
                }
            }
            return format!("@rpath/{name}.framework/Versions/{version}/{name}");
        }
    }

    format!(
        "@rpath/{}",
        binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    )
}

/// Locate a framework bundle's main binary: prefer `Versions/Current/<Name>`,
/// then `Versions/A`..`Versions/Z`, then any subdirectory of `Versions/`.
fn find_framework_binary(framework_root: &Path) -> Option<PathBuf> {
    let dir_name = framework_root.file_name()?.to_string_lossy().into_owned();
    let name = dir_name
        .strip_suffix(".framework")
        .unwrap_or(&dir_name)
        .to_string();

    let versions = framework_root.join("Versions");
    if !versions.is_dir() {
        return None;
    }

    let current = versions.join("Current").join(&name);
    if current.is_file() {
        return Some(current);
    }
    for version in 'A'..='Z' {
        let candidate = versions.join(version.to_string()).join(&name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    for entry in fs::read_dir(&versions).ok()?.flatten() {
        if entry.path().is_dir() {
            let candidate = entry.path().join(&name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn framework_binary_install_name_uses_versions() {
        let name = framework_install_name(
            Path::new("/out/App.app/Contents/Frameworks/QtCore.framework/Versions/A/QtCore"),
            Path::new("/out/App.app"),
        );
        assert_eq!(name, "@rpath/QtCore.framework/Versions/A/QtCore");
    }

    #[test]
    fn versionless_framework_binary_defaults_to_version_a() {
        let name = framework_install_name(
            Path::new("/out/App.app/Contents/Frameworks/QtGui.framework/QtGui"),
            Path::new("/out/App.app"),
        );
        assert_eq!(name, "@rpath/QtGui.framework/Versions/A/QtGui");
    }

    #[test]
    fn loose_dylib_install_name_is_flat() {
        let name = framework_install_name(
            Path::new("/out/App.app/Contents/Frameworks/libcrypto.3.dylib"),
            Path::new("/out/App.app"),
        );
        assert_eq!(name, "@rpath/libcrypto.3.dylib");
    }

    #[test]
    fn framework_binary_found_under_versions() {
        let dir = tempdir().unwrap();
        let fw = dir.path().join("QtCore.framework");
        fs::create_dir_all(fw.join("Versions/A")).unwrap();
        fs::write(fw.join("Versions/A/QtCore"), b"bin").unwrap();
        assert_eq!(
            find_framework_binary(&fw).unwrap(),
            fw.join("Versions/A/QtCore")
        );
    }

    #[test]
    fn framework_binary_prefers_current() {
        let dir = tempdir().unwrap();
        let fw = dir.path().join("QtCore.framework");
        fs::create_dir_all(fw.join("Versions/A")).unwrap();
        fs::create_dir_all(fw.join("Versions/Current")).unwrap();
        fs::write(fw.join("Versions/A/QtCore"), b"a").unwrap();
        fs::write(fw.join("Versions/Current/QtCore"), b"cur").unwrap();
        assert_eq!(
            find_framework_binary(&fw).unwrap(),
            fw.join("Versions/Current/QtCore")
        );
    }

    #[test]
    fn framework_binary_scans_odd_version_names() {
        let dir = tempdir().unwrap();
        let fw = dir.path().join("Sparkle.framework");
        fs::create_dir_all(fw.join("Versions/1.2")).unwrap();
        fs::write(fw.join("Versions/1.2/Sparkle"), b"bin").unwrap();
        assert_eq!(
            find_framework_binary(&fw).unwrap(),
            fw.join("Versions/1.2/Sparkle")
        );
    }

    #[test]
    fn path_within_handles_missing_paths() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("Frameworks");
        fs::create_dir_all(&prefix).unwrap();
        assert!(path_within(&prefix.join("QtCore.framework/QtCore"), &prefix));
        assert!(!path_within(Path::new("/elsewhere/QtCore"), &prefix));
    }
}
