//! Staging of resolved libraries, plugins, and the main executable.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::core::detect::BinaryKind;
use crate::core::parse;
use crate::core::plan::DeployPlan;
use crate::core::resolve::{env_path_entries, ResolveContext};
use crate::io::fsops;
use crate::ops::linkedit;

const IMAGE_FORMAT_PLUGINS: [&str; 4] = ["jpeg", "ico", "gif", "png"];

/// Copy the resolved libraries into the format's library destination.
pub fn stage_libraries(plan: &DeployPlan, libraries: &[PathBuf]) {
    match plan.kind {
        BinaryKind::Pe => stage_libraries_pe(plan, libraries),
        BinaryKind::Elf => stage_libraries_elf(plan, libraries),
        BinaryKind::MachO => stage_libraries_macho(plan, libraries),
    }
}

fn stage_libraries_pe(plan: &DeployPlan, libraries: &[PathBuf]) {
    for library in libraries {
        let Some(name) = library.file_name() else { continue };
        fsops::copy_file_or_warn(library, &plan.output_root.join(name));
    }
    if let Err(err) = fsops::write_qt_conf(plan) {
        eprintln!("Warning: failed to write qt.conf: {err}");
    }
}

fn stage_libraries_elf(plan: &DeployPlan, libraries: &[PathBuf]) {
    let lib_dir = plan.output_root.join("usr/lib");
    for library in libraries {
        let Some(name) = library.file_name() else { continue };
        let dest = lib_dir.join(name);
        if !fsops::copy_file_or_warn(library, &dest) {
            continue;
        }

        // Dependents reference the SONAME, not the on-disk filename.
        let dest_name = name.to_string_lossy();
        if let Some(soname) = parse::elf_soname(&dest) {
            if soname != dest_name {
                let link_path = lib_dir.join(&soname);
                let _ = fs::remove_file(&link_path);
                if fsops::make_symlink(Path::new(dest_name.as_ref()), &link_path).is_err() {
                    fsops::copy_file_or_warn(&dest, &link_path);
                }
            }
        }
    }
    if let Err(err) = fsops::write_qt_conf(plan) {
        eprintln!("Warning: failed to write qt.conf: {err}");
    }
}

fn stage_libraries_macho(plan: &DeployPlan, libraries: &[PathBuf]) {
    let frameworks_dir = plan.output_root.join("Contents/Frameworks");
    let mut copied_frameworks = BTreeSet::new();
    for library in libraries {
        tracing::debug!("stage {}", library.display());
        match framework_root(library) {
            Some(fw_root) => {
                let Some(fw_name) = fw_root.file_name() else { continue };
                // One copy per distinct framework bundle.
                if !copied_frameworks.insert(fw_name.to_os_string()) {
                    continue;
                }
                let dest = frameworks_dir.join(fw_name);
                tracing::debug!("framework {} -> {}", fw_root.display(), dest.display());
                copy_tree_skip_symlinks(&fw_root, &dest);
            }
            None => {
                let Some(name) = library.file_name() else { continue };
                fsops::copy_file_or_warn(library, &frameworks_dir.join(name));
            }
        }
    }
}

/// Nearest ancestor that is a `.framework` bundle, if the library lives in
/// one.
fn framework_root(library: &Path) -> Option<PathBuf> {
    library
        .ancestors()
        .skip(1)
        .find(|a| a.extension().is_some_and(|e| e == "framework"))
        .map(Path::to_path_buf)
}

fn copy_tree_skip_symlinks(src_root: &Path, dst_root: &Path) {
    for entry in WalkDir::new(src_root).into_iter().flatten() {
        if entry.file_type().is_symlink() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src_root)
            .unwrap_or_else(|_| entry.path());
        let dst = dst_root.join(rel);
        if entry.file_type().is_dir() {
            let _ = fs::create_dir_all(&dst);
        } else if entry.file_type().is_file() {
            fsops::copy_file_or_warn(entry.path(), &dst);
        }
    }
}

/// Copy the main executable into place and make the copy relocatable.
pub fn stage_main_binary(plan: &DeployPlan) {
    let Some(name) = plan.binary_path.file_name() else {
        return;
    };
    match plan.kind {
        BinaryKind::Pe => {
            let dest = plan.output_root.join(name);
            fsops::copy_file_or_warn(&plan.binary_path, &dest);
        }
        BinaryKind::Elf => {
            let dest = plan.output_root.join("usr/bin").join(name);
            if fsops::copy_file_or_warn(&plan.binary_path, &dest) {
                linkedit::set_elf_runpath(&dest, linkedit::ELF_MAIN_RUNPATH);
            }
        }
        BinaryKind::MachO => {
            let dest = plan.output_root.join("Contents/MacOS").join(name);
            if fsops::copy_file_or_warn(&plan.binary_path, &dest) {
                linkedit::add_macho_rpath(&dest, linkedit::MACHO_MAIN_RPATH);
            }
        }
    }
}

/// Stage the platform plugin and the fixed set of image-format plugins
/// from the Qt plugin root into the format's plugin destination.
pub fn stage_plugins(ctx: &ResolveContext, plan: &DeployPlan, resolved_libs: &[PathBuf]) {
    match plan.kind {
        BinaryKind::Pe => stage_plugins_pe(ctx, plan, resolved_libs),
        BinaryKind::Elf => stage_plugins_elf(ctx, plan),
        BinaryKind::MachO => stage_plugins_macho(ctx, plan),
    }
}

fn stage_plugins_pe(ctx: &ResolveContext, plan: &DeployPlan, resolved_libs: &[PathBuf]) {
    let mut plugin_roots: Vec<PathBuf> = Vec::new();
    if let Some(plugins) = &ctx.qt.install_plugins {
        plugin_roots.push(plugins.clone());
    }
    plugin_roots.extend(env_path_entries("MINGW_QT_PLUGINS"));

    // MinGW layouts keep plugins/ next to bin/.
    for entry in env_path_entries("PATH") {
        if entry.file_name().is_some_and(|n| n == "bin") {
            let Some(base) = entry.parent() else { continue };
            for candidate in [base.join("plugins"), base.join("lib/qt-6/plugins")] {
                if candidate.exists() {
                    plugin_roots.push(candidate);
                }
            }
        }
    }

    // The directory holding the resolved Qt6Core.dll knows where its
    // plugins live.
    for library in resolved_libs {
        let name = library
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name == "qt6core.dll" {
            if let Some(base) = library.parent().and_then(Path::parent) {
                for candidate in [base.join("plugins"), base.join("lib/qt-6/plugins")] {
                    if candidate.exists() {
                        plugin_roots.push(candidate);
                    }
                }
            }
            break;
        }
    }

    plugin_roots.sort();
    plugin_roots.dedup();

    for root in &plugin_roots {
        let platform_dll = root.join("platforms/qwindows.dll");
        if !platform_dll.exists() {
            continue;
        }
        tracing::debug!("plugin root {}", root.display());
        fsops::copy_file_or_warn(
            &platform_dll,
            &plan.output_root.join("plugins/platforms/qwindows.dll"),
        );
        for format in IMAGE_FORMAT_PLUGINS {
            let name = format!("q{format}.dll");
            let src = root.join("imageformats").join(&name);
            if src.exists() {
                fsops::copy_file_or_warn(
                    &src,
                    &plan.output_root.join("plugins/imageformats").join(&name),
                );
            }
        }
        break;
    }
}

fn stage_plugins_elf(ctx: &ResolveContext, plan: &DeployPlan) {
    let Some(src) = &ctx.qt.install_plugins else {
        return;
    };
    let platform_so = src.join("platforms/libqxcb.so");
    if platform_so.exists() {
        fsops::copy_file_or_warn(
            &platform_so,
            &plan.output_root.join("usr/plugins/platforms/libqxcb.so"),
        );
    }
    for format in IMAGE_FORMAT_PLUGINS {
        let name = format!("libq{format}.so");
        let plugin = src.join("imageformats").join(&name);
        if plugin.exists() {
            fsops::copy_file_or_warn(
                &plugin,
                &plan.output_root.join("usr/plugins/imageformats").join(&name),
            );
        }
    }
    linkedit::apply_elf_plugin_runpaths(plan);
}

fn stage_plugins_macho(ctx: &ResolveContext, plan: &DeployPlan) {
    let Some(src) = &ctx.qt.install_plugins else {
        return;
    };
    let plugins_dest = plan.output_root.join("Contents/PlugIns");
    let platform_dylib = src.join("platforms/libqcocoa.dylib");
    if platform_dylib.exists() {
        fsops::copy_file_or_warn(
            &platform_dylib,
            &plugins_dest.join("platforms/libqcocoa.dylib"),
        );
    }
    for format in IMAGE_FORMAT_PLUGINS {
        let name = format!("libq{format}.dylib");
        let plugin = src.join("imageformats").join(&name);
        if plugin.exists() {
            fsops::copy_file_or_warn(&plugin, &plugins_dest.join("imageformats").join(&name));
        }
    }
    linkedit::add_macho_plugin_rpaths(plan);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn framework_root_finds_bundle_ancestor() {
        assert_eq!(
            framework_root(Path::new(
                "/opt/qt/lib/QtCore.framework/Versions/A/QtCore"
            )),
            Some(PathBuf::from("/opt/qt/lib/QtCore.framework"))
        );
        assert_eq!(framework_root(Path::new("/opt/qt/lib/libz.dylib")), None);
    }

    #[cfg(unix)]
    #[test]
    fn tree_copy_skips_symlinks() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("QtCore.framework");
        fs::create_dir_all(src.join("Versions/A")).unwrap();
        fs::write(src.join("Versions/A/QtCore"), b"bin").unwrap();
        std::os::unix::fs::symlink("A", src.join("Versions/Current")).unwrap();

        let dst = dir.path().join("out/QtCore.framework");
        copy_tree_skip_symlinks(&src, &dst);
        assert!(dst.join("Versions/A/QtCore").is_file());
        assert!(!dst.join("Versions/Current").exists());
    }

    #[test]
    fn macho_framework_copied_once_per_bundle() {
        let dir = tempdir().unwrap();
        let qt_lib = dir.path().join("qt/lib");
        let fw = qt_lib.join("QtCore.framework/Versions/A");
        fs::create_dir_all(&fw).unwrap();
        fs::write(fw.join("QtCore"), b"core").unwrap();
        fs::write(fw.join("QtCore_debug"), b"debug").unwrap();

        let out = dir.path().join("App.app");
        let plan = DeployPlan {
            kind: BinaryKind::MachO,
            binary_path: dir.path().join("App"),
            output_root: out.clone(),
            qml_roots: Vec::new(),
            languages: Vec::new(),
            overlays: Vec::new(),
        };
        stage_libraries_macho(
            &plan,
            &[fw.join("QtCore"), fw.join("QtCore_debug")],
        );
        assert!(out
            .join("Contents/Frameworks/QtCore.framework/Versions/A/QtCore")
            .is_file());
        assert!(out
            .join("Contents/Frameworks/QtCore.framework/Versions/A/QtCore_debug")
            .is_file());
    }
}
