//! QML module discovery and staging.
//!
//! QML imports are discovered by the external `qmlimportscanner`, whose
//! JSON output names each imported module's source directory and its
//! install-relative subpath. Modules are copied into the format's QML
//! destination; on macOS, native plugin dylibs inside a module are
//! relocated into `Contents/PlugIns/quick/` and replaced by relative
//! symlinks so the bundle keeps all executable code under `PlugIns/`.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use walkdir::WalkDir;

use crate::core::detect::BinaryKind;
use crate::core::parse::{self, ParseCache};
use crate::core::plan::DeployPlan;
use crate::core::resolve::{self, ResolveContext};
use crate::core::tools::QML_IMPORT_SCANNER;
use crate::io::command::tool_stdout;
use crate::io::fsops;
use crate::ops::stage;

/// One module reported by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QmlModule {
    pub source: PathBuf,
    pub relative: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ScannerEntry {
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default, rename = "relativePath")]
    relative_path: Option<PathBuf>,
}

fn qml_dest_base(plan: &DeployPlan) -> PathBuf {
    match plan.kind {
        BinaryKind::MachO => plan.output_root.join("Contents/Resources/qml"),
        BinaryKind::Elf => plan.output_root.join("usr/qml"),
        BinaryKind::Pe => plan.output_root.join("qml"),
    }
}

fn contains_qml_file(dir: &Path) -> bool {
    dir.is_dir()
        && WalkDir::new(dir).into_iter().flatten().any(|entry| {
            entry.file_type().is_file()
                && entry.path().extension().is_some_and(|e| e == "qml")
        })
}

/// QML roots to scan: user-supplied roots (CLI and `QML_ROOT`) take
/// precedence; otherwise the working directory and the binary's directory
/// are probed for QML sources.
fn discover_qml_roots(ctx: &ResolveContext) -> Vec<PathBuf> {
    let mut roots = ctx.cli_qml_roots.clone();
    if roots.is_empty() {
        if let Ok(cwd) = std::env::current_dir() {
            if contains_qml_file(&cwd) {
                roots.push(cwd);
            }
        }
        if let Some(bin_dir) = ctx.plan.binary_path.parent() {
            if contains_qml_file(bin_dir) {
                roots.push(bin_dir.to_path_buf());
            }
        }
    }
    roots.sort();
    roots.dedup();
    roots
}

fn parse_scanner_output(out: &str, install_qml: Option<&Path>) -> Vec<QmlModule> {
    let Ok(entries) = serde_json::from_str::<Vec<ScannerEntry>>(out) else {
        return Vec::new();
    };
    entries
        .into_iter()
        .filter_map(|entry| {
            let source = entry.path?;
            let relative = match entry.relative_path {
                Some(rel) if !rel.as_os_str().is_empty() => rel,
                // The scanner omits relativePath for modules found outside
                // the Qt QML root; recompute by stripping that prefix,
                // else fall back to the basename.
                _ => match install_qml.and_then(|qml| source.strip_prefix(qml).ok()) {
                    Some(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
                    _ => PathBuf::from(source.file_name()?),
                },
            };
            Some(QmlModule { source, relative })
        })
        .collect()
}

fn scan_modules(ctx: &ResolveContext, roots: &[PathBuf]) -> Vec<QmlModule> {
    let mut modules = Vec::new();
    for root in roots {
        let mut args: Vec<OsString> = vec![OsString::from("-rootPath"), root.clone().into()];
        for import_path in &ctx.qml_import_paths {
            args.push(OsString::from("-importPath"));
            args.push(import_path.clone().into());
        }
        let Some(out) = tool_stdout(QML_IMPORT_SCANNER, &args) else {
            continue;
        };
        modules.extend(parse_scanner_output(&out, ctx.qt.install_qml.as_deref()));
    }
    modules.sort_by(|a, b| a.source.cmp(&b.source));
    modules.dedup_by(|a, b| a.source == b.source);
    modules
}

/// Discover and copy every imported QML module into the output tree.
pub fn stage_qml_modules(ctx: &ResolveContext, plan: &DeployPlan) {
    let roots = discover_qml_roots(ctx);
    if roots.is_empty() {
        return;
    }
    tracing::debug!("qml roots: {roots:?}");

    let modules = scan_modules(ctx, &roots);
    let dest_base = qml_dest_base(plan);
    for module in modules {
        let dest = dest_base.join(&module.relative);
        tracing::debug!("qml module {} -> {}", module.source.display(), dest.display());
        if let Err(err) = copy_qml_module(plan, &module.source, &dest) {
            eprintln!(
                "Warning: failed to stage QML module {}: {err}",
                module.source.display()
            );
        }
    }
}

fn copy_qml_module(plan: &DeployPlan, source: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in WalkDir::new(source).into_iter().flatten() {
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source)
            .unwrap_or_else(|_| entry.path());
        let out = dest.join(rel);

        if plan.kind == BinaryKind::MachO {
            let is_link = entry.file_type().is_symlink();
            let target = if is_link {
                parse::canonical_path(entry.path())
            } else {
                entry.path().to_path_buf()
            };
            if target.extension().is_some_and(|e| e == "dylib") {
                relocate_qml_plugin(plan, &target, &out)?;
                continue;
            }
            if is_link {
                continue;
            }
        } else if entry.file_type().is_symlink() {
            continue;
        }

        if entry.file_type().is_file() {
            fsops::copy_file_overwrite(entry.path(), &out)?;
        }
    }
    Ok(())
}

// Move the plugin dylib under PlugIns/quick/ and leave a relative symlink
// at its place in the module tree (a plain copy when symlinks are
// unavailable).
fn relocate_qml_plugin(plan: &DeployPlan, dylib: &Path, module_location: &Path) -> std::io::Result<()> {
    let quick_dir = plan.output_root.join("Contents/PlugIns/quick");
    fs::create_dir_all(&quick_dir)?;
    let Some(name) = dylib.file_name() else {
        return Ok(());
    };
    let relocated = quick_dir.join(name);
    tracing::debug!("qml plugin {} -> {}", dylib.display(), relocated.display());
    fsops::copy_file_overwrite(dylib, &relocated)?;

    let parent = module_location.parent().unwrap_or_else(|| Path::new(""));
    fs::create_dir_all(parent)?;
    let _ = fs::remove_file(module_location);
    let link_target = fsops::relative_path_from(parent, &relocated);
    if fsops::make_symlink(&link_target, module_location).is_err() {
        fsops::copy_file_overwrite(&relocated, module_location)?;
    }
    Ok(())
}

/// Native plugin libraries inside the staged QML tree (and, on macOS,
/// under `PlugIns/quick/`), deduplicated by canonical path.
fn list_qml_plugin_libraries(plan: &DeployPlan) -> Vec<PathBuf> {
    let extension = plan.kind.plugin_extension();
    let mut seen = std::collections::HashSet::new();
    let mut libraries = Vec::new();

    let mut scan = |base: &Path| {
        for entry in WalkDir::new(base).into_iter().flatten() {
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|e| e == extension)
                && seen.insert(parse::canonical_key(entry.path()))
            {
                libraries.push(entry.path().to_path_buf());
            }
        }
    };

    scan(&qml_dest_base(plan));
    if plan.kind == BinaryKind::MachO {
        scan(&plan.output_root.join("Contents/PlugIns/quick"));
    }
    libraries
}

/// Walk the shared-library dependencies of every staged QML plugin and
/// stage the newly discovered libraries. The plugins themselves are
/// already in place.
pub fn stage_qml_plugin_dependencies(
    ctx: &ResolveContext,
    plan: &DeployPlan,
    cache: &mut ParseCache,
) {
    let seeds = list_qml_plugin_libraries(plan);
    if seeds.is_empty() {
        return;
    }
    for seed in &seeds {
        tracing::debug!("qml plugin seed {}", seed.display());
    }
    let dependencies = resolve::resolve_dependencies_of(&seeds, ctx, cache);
    if dependencies.is_empty() {
        return;
    }
    stage::stage_libraries(plan, &dependencies);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scanner_json_yields_modules() {
        let out = r#"[
            {
                "name": "QtQuick",
                "path": "/opt/qt/qml/QtQuick",
                "relativePath": "QtQuick",
                "plugins": [{"name": "qtquick2plugin"}]
            },
            {
                "name": "Custom.MyMod",
                "path": "/src/qml/Custom/MyMod"
            },
            {
                "name": "QtQml.Models"
            }
        ]"#;
        let modules = parse_scanner_output(out, Some(Path::new("/opt/qt/qml")));
        assert_eq!(modules.len(), 2);
        assert_eq!(
            modules[0],
            QmlModule {
                source: PathBuf::from("/opt/qt/qml/QtQuick"),
                relative: PathBuf::from("QtQuick"),
            }
        );
        // No relativePath and outside the Qt QML root: basename.
        assert_eq!(modules[1].relative, PathBuf::from("MyMod"));
    }

    #[test]
    fn missing_relative_path_is_stripped_from_install_root() {
        let out = r#"[{"path": "/opt/qt/qml/QtQuick/Controls"}]"#;
        let modules = parse_scanner_output(out, Some(Path::new("/opt/qt/qml")));
        assert_eq!(modules[0].relative, PathBuf::from("QtQuick/Controls"));
    }

    #[test]
    fn malformed_scanner_output_is_empty() {
        assert!(parse_scanner_output("not json", None).is_empty());
        assert!(parse_scanner_output("{}", None).is_empty());
    }

    #[test]
    fn qml_probe_finds_sources_recursively() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("ui/pages")).unwrap();
        assert!(!contains_qml_file(dir.path()));
        fs::write(dir.path().join("ui/pages/Main.qml"), b"Item {}").unwrap();
        assert!(contains_qml_file(dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn macho_plugin_dylib_is_relocated_with_symlink() {
        let dir = tempdir().unwrap();
        let out_root = dir.path().join("App.app");
        let plan = DeployPlan {
            kind: BinaryKind::MachO,
            binary_path: dir.path().join("App"),
            output_root: out_root.clone(),
            qml_roots: Vec::new(),
            languages: Vec::new(),
            overlays: Vec::new(),
        };

        let module_src = dir.path().join("qml/Custom/MyMod");
        fs::create_dir_all(&module_src).unwrap();
        fs::write(module_src.join("qmldir"), b"module Custom.MyMod").unwrap();
        fs::write(module_src.join("MyMod.dylib"), b"plugin-code").unwrap();

        let dest = out_root.join("Contents/Resources/qml/Custom/MyMod");
        copy_qml_module(&plan, &module_src, &dest).unwrap();

        let relocated = out_root.join("Contents/PlugIns/quick/MyMod.dylib");
        assert_eq!(fs::read(&relocated).unwrap(), b"plugin-code");

        let in_module = dest.join("MyMod.dylib");
        assert!(in_module
            .symlink_metadata()
            .unwrap()
            .file_type()
            .is_symlink());
        // The symlink resolves back to the relocated plugin.
        assert_eq!(fs::read(&in_module).unwrap(), b"plugin-code");
        assert_eq!(fs::read(dest.join("qmldir")).unwrap(), b"module Custom.MyMod");
    }

    #[test]
    fn elf_module_copy_keeps_shared_objects_in_place() {
        let dir = tempdir().unwrap();
        let out_root = dir.path().join("app.AppDir");
        let plan = DeployPlan {
            kind: BinaryKind::Elf,
            binary_path: dir.path().join("app"),
            output_root: out_root.clone(),
            qml_roots: Vec::new(),
            languages: Vec::new(),
            overlays: Vec::new(),
        };

        let module_src = dir.path().join("qml/Custom/MyMod");
        fs::create_dir_all(&module_src).unwrap();
        fs::write(module_src.join("libmymod.so"), b"plugin").unwrap();

        let dest = out_root.join("usr/qml/Custom/MyMod");
        copy_qml_module(&plan, &module_src, &dest).unwrap();
        assert_eq!(fs::read(dest.join("libmymod.so")).unwrap(), b"plugin");

        let listed = list_qml_plugin_libraries(&plan);
        assert_eq!(listed.len(), 1);
        assert!(listed[0].ends_with("libmymod.so"));
    }
}
