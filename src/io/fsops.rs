//! Output tree construction and file copying.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::core::detect::BinaryKind;
use crate::core::parse;
use crate::core::plan::DeployPlan;

/// Create the per-format directory skeleton before any file is staged.
pub fn ensure_output_layout(plan: &DeployPlan) -> io::Result<()> {
    let root = &plan.output_root;
    fs::create_dir_all(root)?;
    match plan.kind {
        BinaryKind::Pe => {
            fs::create_dir_all(root.join("plugins/platforms"))?;
            fs::create_dir_all(root.join("plugins/imageformats"))?;
            fs::create_dir_all(root.join("qml"))?;
            fs::create_dir_all(root.join("translations"))?;
        }
        BinaryKind::Elf => {
            fs::create_dir_all(root.join("usr/bin"))?;
            fs::create_dir_all(root.join("usr/lib"))?;
            fs::create_dir_all(root.join("usr/plugins/platforms"))?;
            fs::create_dir_all(root.join("usr/plugins/imageformats"))?;
            fs::create_dir_all(root.join("usr/qml"))?;
            fs::create_dir_all(root.join("usr/translations"))?;
        }
        BinaryKind::MachO => {
            fs::create_dir_all(root.join("Contents/MacOS"))?;
            fs::create_dir_all(root.join("Contents/Frameworks"))?;
            fs::create_dir_all(root.join("Contents/Resources/qml"))?;
            fs::create_dir_all(root.join("Contents/Resources/translations"))?;
            fs::create_dir_all(root.join("Contents/PlugIns/quick"))?;
            fs::create_dir_all(root.join("Contents/PlugIns/platforms"))?;
            fs::create_dir_all(root.join("Contents/PlugIns/imageformats"))?;
        }
    }
    Ok(())
}

/// Copy `from` to `to`, creating parent directories.
///
/// Idempotent: the copy is skipped when the destination already exists as a
/// regular file of identical size with a modification time at least as new
/// as the source's. After a copy the destination gains owner write
/// permission so later link editing can patch it in place.
pub fn copy_file_overwrite(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }

    if copy_is_current(from, to) {
        tracing::debug!("copy skip {} -> {}", from.display(), to.display());
        return Ok(());
    }

    fs::copy(from, to)?;
    add_owner_write(to);
    Ok(())
}

/// [`copy_file_overwrite`] with the standard staging warning on failure.
/// Returns whether the destination is usable.
pub fn copy_file_or_warn(from: &Path, to: &Path) -> bool {
    match copy_file_overwrite(from, to) {
        Ok(()) => true,
        Err(err) => {
            eprintln!(
                "Warning: failed to copy {} -> {}: {err}",
                from.display(),
                to.display()
            );
            false
        }
    }
}

fn copy_is_current(from: &Path, to: &Path) -> bool {
    let (Ok(src), Ok(dst)) = (fs::metadata(from), fs::metadata(to)) else {
        return false;
    };
    if !dst.is_file() || src.len() != dst.len() {
        return false;
    }
    match (src.modified(), dst.modified()) {
        (Ok(src_time), Ok(dst_time)) => dst_time >= src_time,
        _ => false,
    }
}

fn add_owner_write(path: &Path) {
    let Ok(meta) = fs::metadata(path) else { return };
    let mut perms = meta.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() | 0o200);
    }
    #[cfg(not(unix))]
    perms.set_readonly(false);
    let _ = fs::set_permissions(path, perms);
}

/// Platform symlink creation for regular-file targets.
pub fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }
    #[cfg(windows)]
    {
        std::os::windows::fs::symlink_file(target, link)
    }
}

/// Recursively merge `src_root` into `dst_root`. Symlinks are recreated
/// (falling back to copying their target); regular files go through the
/// idempotent copier, so overlay files override staged ones.
pub fn merge_directory_tree(src_root: &Path, dst_root: &Path) {
    if !src_root.is_dir() {
        return;
    }
    for entry in WalkDir::new(src_root).into_iter().flatten() {
        if entry.depth() == 0 {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src_root)
            .unwrap_or_else(|_| entry.path());
        let dst = dst_root.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            let _ = fs::create_dir_all(&dst);
            continue;
        }
        if let Some(parent) = dst.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if file_type.is_symlink() {
            let _ = fs::remove_file(&dst);
            let Ok(target) = fs::read_link(entry.path()) else {
                continue;
            };
            if make_symlink(&target, &dst).is_err() {
                let base = entry.path().parent().unwrap_or_else(|| Path::new(""));
                let resolved = parse::canonical_path(&base.join(&target));
                if resolved.is_file() {
                    copy_file_or_warn(&resolved, &dst);
                }
            }
            continue;
        }
        if file_type.is_file() {
            copy_file_or_warn(entry.path(), &dst);
        }
    }
}

/// Merge each user-supplied overlay directory into the output root.
pub fn apply_overlays(plan: &DeployPlan) {
    for overlay in &plan.overlays {
        if !overlay.is_dir() {
            continue;
        }
        tracing::debug!(
            "overlay merge {} -> {}",
            overlay.display(),
            plan.output_root.display()
        );
        merge_directory_tree(overlay, &plan.output_root);
    }
}

/// Write the qt.conf next to the main executable so Qt finds sibling
/// plugins, QML modules, and translations at run time. Mach-O bundles use
/// bundle conventions and need none.
pub fn write_qt_conf(plan: &DeployPlan) -> io::Result<()> {
    let (conf_path, prefix) = match plan.kind {
        BinaryKind::MachO => return Ok(()),
        BinaryKind::Elf => (plan.output_root.join("usr/bin/qt.conf"), ".."),
        BinaryKind::Pe => (plan.output_root.join("qt.conf"), "."),
    };
    let subdir = |name: &str| {
        if plan.kind == BinaryKind::Elf {
            format!("../{name}")
        } else {
            name.to_string()
        }
    };

    let mut file = fs::File::create(conf_path)?;
    writeln!(file, "[Paths]")?;
    writeln!(file, "Prefix={prefix}")?;
    writeln!(file, "Plugins={}", subdir("plugins"))?;
    writeln!(file, "Qml2Imports={}", subdir("qml"))?;
    writeln!(file, "Translations={}", subdir("translations"))?;
    Ok(())
}

/// Relative path from `from_dir` to `to`; both must share a common root.
pub fn relative_path_from(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from_dir.components().collect();
    let to_comps: Vec<_> = to.components().collect();
    let common = from
        .iter()
        .zip(&to_comps)
        .take_while(|(a, b)| a == b)
        .count();
    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for comp in &to_comps[common..] {
        rel.push(comp.as_os_str());
    }
    rel
}
