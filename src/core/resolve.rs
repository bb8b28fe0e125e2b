//! Library reference resolution.
//!
//! Assembles the per-platform search list, resolves one import reference
//! to an on-disk path using that platform's linker rules, filters through
//! the deploy policy, and walks the transitive dependency graph.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::core::detect::BinaryKind;
use crate::core::parse::{self, ParseCache, ParseResult};
use crate::core::plan::DeployPlan;
use crate::core::qt_paths::QtPaths;
use crate::ops::DeployError;

/// Per-run resolution state: the search directory list (ordered by
/// resolution priority, deduplicated by canonical path), the QML import
/// paths handed to the scanner, and the QML roots requested by the user.
pub struct ResolveContext<'a> {
    pub plan: &'a DeployPlan,
    pub qt: &'a QtPaths,
    pub search_dirs: Vec<PathBuf>,
    search_dir_keys: HashSet<String>,
    pub qml_import_paths: Vec<PathBuf>,
    pub cli_qml_roots: Vec<PathBuf>,
}

impl<'a> ResolveContext<'a> {
    /// An empty context; search paths are not assembled.
    pub fn new(plan: &'a DeployPlan, qt: &'a QtPaths) -> Self {
        Self {
            plan,
            qt,
            search_dirs: Vec::new(),
            search_dir_keys: HashSet::new(),
            qml_import_paths: Vec::new(),
            cli_qml_roots: Vec::new(),
        }
    }

    /// A context with the platform search list assembled from the binary
    /// directory, the environment, and the Qt install roots. Also
    /// re-exports the loader path variables with the Qt roots prepended so
    /// child helper processes resolve against the same installation.
    pub fn prepare(plan: &'a DeployPlan, qt: &'a QtPaths) -> Self {
        let mut ctx = Self::new(plan, qt);
        ctx.assemble_search_paths();
        ctx
    }

    /// Append a search directory unless an equivalent path is already
    /// present. Insertion order is the resolution priority order.
    pub fn add_search_dir(&mut self, dir: &Path) {
        if dir.as_os_str().is_empty() {
            return;
        }
        let key = parse::canonical_key(dir);
        if self.search_dir_keys.insert(key.clone()) {
            self.search_dirs.push(PathBuf::from(key));
        }
    }

    fn assemble_search_paths(&mut self) {
        if let Some(dir) = self.plan.binary_path.parent() {
            self.add_search_dir(dir);
        }

        match self.plan.kind {
            BinaryKind::Elf => {
                self.add_env_paths("LD_LIBRARY_PATH");
                if let Some(libs) = self.qt.install_libs.clone() {
                    self.add_search_dir(&libs);
                    prepend_env_path("LD_LIBRARY_PATH", &libs);
                }
            }
            BinaryKind::Pe => {
                let path_entries = env_path_entries("PATH");
                for entry in &path_entries {
                    self.add_search_dir(entry);
                }
                if let Some(bins) = self.qt.install_bins.clone() {
                    self.add_search_dir(&bins);
                    prepend_env_path("PATH", &bins);
                }
                // MinGW layouts keep qml/ next to bin/.
                for entry in &path_entries {
                    if entry.file_name().is_some_and(|n| n == "bin") {
                        let Some(base) = entry.parent() else { continue };
                        for candidate in [base.join("qml"), base.join("lib/qt-6/qml")] {
                            if candidate.exists() {
                                self.qml_import_paths.push(candidate);
                            }
                        }
                    }
                }
            }
            BinaryKind::MachO => {
                self.add_env_paths("DYLD_LIBRARY_PATH");
                self.add_env_paths("DYLD_FRAMEWORK_PATH");
                if let Some(libs) = self.qt.install_libs.clone() {
                    self.add_search_dir(&libs);
                    prepend_env_path("DYLD_LIBRARY_PATH", &libs);
                    prepend_env_path("DYLD_FRAMEWORK_PATH", &libs);
                }
            }
        }

        if let Some(qml) = &self.qt.install_qml {
            if qml.exists() {
                self.qml_import_paths.push(qml.clone());
            }
        }
        for entry in env_path_entries("QML2_IMPORT_PATH") {
            if entry.exists() {
                self.qml_import_paths.push(entry);
            }
        }

        self.cli_qml_roots.extend(self.plan.qml_roots.iter().cloned());
        self.cli_qml_roots.extend(env_path_entries("QML_ROOT"));
    }

    fn add_env_paths(&mut self, var: &str) {
        for entry in env_path_entries(var) {
            self.add_search_dir(&entry);
        }
    }

    /// Look up a bare library name (or an absolute path) in the global
    /// search list.
    pub fn find_library(&self, name_or_path: &str) -> Option<PathBuf> {
        let as_path = Path::new(name_or_path);
        if as_path.is_absolute() && as_path.exists() {
            return Some(parse::canonical_path(as_path));
        }
        for dir in &self.search_dirs {
            let candidate = dir.join(name_or_path);
            if candidate.exists() {
                return Some(parse::canonical_path(&candidate));
            }
        }
        None
    }
}

/// Non-empty entries of a separator-delimited path list variable.
pub fn env_path_entries(var: &str) -> Vec<PathBuf> {
    match std::env::var_os(var) {
        Some(value) => std::env::split_paths(&value)
            .filter(|p| !p.as_os_str().is_empty())
            .collect(),
        None => Vec::new(),
    }
}

fn prepend_env_path(var: &str, dir: &Path) {
    let mut entries = vec![dir.to_path_buf()];
    if let Some(existing) = std::env::var_os(var) {
        entries.extend(std::env::split_paths(&existing));
    }
    if let Ok(joined) = std::env::join_paths(entries) {
        std::env::set_var(var, joined);
    }
}

fn expand_elf_origin(rpath: &str, subject: &Path) -> PathBuf {
    let origin = subject
        .parent()
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_default();
    PathBuf::from(rpath.replace("${ORIGIN}", &origin).replace("$ORIGIN", &origin))
}

fn expand_macho_token(entry: &str, subject: &Path, main_exe: &Path) -> PathBuf {
    if let Some(rest) = entry.strip_prefix("@loader_path/") {
        return subject.parent().unwrap_or(Path::new("")).join(rest);
    }
    if let Some(rest) = entry.strip_prefix("@executable_path/") {
        return main_exe.parent().unwrap_or(Path::new("")).join(rest);
    }
    PathBuf::from(entry)
}

/// Resolve one dependency reference (a bare name, an absolute path, or a
/// token-prefixed path like `@rpath/QtCore.framework/...`) against the
/// subject's own rpaths and the global search list.
pub fn resolve_ref(
    kind: BinaryKind,
    reference: &str,
    subject: &Path,
    subject_parsed: &ParseResult,
    ctx: &ResolveContext,
    cache: &mut ParseCache,
    main_exe: &Path,
) -> Option<PathBuf> {
    match kind {
        BinaryKind::Elf => resolve_elf_ref(reference, subject, &subject_parsed.rpaths, ctx),
        BinaryKind::Pe => ctx.find_library(reference),
        BinaryKind::MachO => {
            let rpaths = cache.macho_rpaths(subject).to_vec();
            resolve_macho_ref(reference, subject, &rpaths, ctx, main_exe)
        }
    }
}

fn resolve_elf_ref(
    reference: &str,
    subject: &Path,
    subject_rpaths: &[String],
    ctx: &ResolveContext,
) -> Option<PathBuf> {
    let as_path = Path::new(reference);
    if as_path.is_absolute() && as_path.exists() {
        return Some(parse::canonical_path(as_path));
    }
    for rpath in subject_rpaths {
        let candidate = expand_elf_origin(rpath, subject).join(reference);
        if candidate.exists() {
            return Some(parse::canonical_path(&candidate));
        }
    }
    ctx.find_library(reference)
}

fn resolve_macho_ref(
    reference: &str,
    subject: &Path,
    subject_rpaths: &[String],
    ctx: &ResolveContext,
    main_exe: &Path,
) -> Option<PathBuf> {
    let as_path = Path::new(reference);
    if as_path.is_absolute() && as_path.exists() {
        return Some(parse::canonical_path(as_path));
    }
    if reference.starts_with("@loader_path/") || reference.starts_with("@executable_path/") {
        let candidate = expand_macho_token(reference, subject, main_exe);
        if candidate.exists() {
            return Some(parse::canonical_path(&candidate));
        }
    }
    if let Some(tail) = reference.strip_prefix("@rpath/") {
        for rpath in subject_rpaths {
            let candidate = expand_macho_token(rpath, subject, main_exe).join(tail);
            if candidate.exists() {
                return Some(parse::canonical_path(&candidate));
            }
        }
    }
    ctx.find_library(reference)
}

/// Whether a library name follows the Qt naming convention.
pub fn is_qt_library_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("qt6") || lower.starts_with("qt")
}

const PE_SYSTEM_DLLS: [&str; 15] = [
    "kernel32.dll",
    "user32.dll",
    "gdi32.dll",
    "shell32.dll",
    "ole32.dll",
    "advapi32.dll",
    "ws2_32.dll",
    "ntdll.dll",
    "sechost.dll",
    "shlwapi.dll",
    "comdlg32.dll",
    "imm32.dll",
    "version.dll",
    "winmm.dll",
    "cfgmgr32.dll",
];

/// Decide whether a resolved library belongs in the distribution or is a
/// host/system artifact to skip. Pure in (path, basename, format, Qt
/// roots, binary directory).
pub fn should_deploy_library(lib_path: &Path, kind: BinaryKind, ctx: &ResolveContext) -> bool {
    let base = lib_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let co_located = match (lib_path.parent(), ctx.plan.binary_path.parent()) {
        (Some(dir), Some(bin_dir)) => dir == bin_dir,
        _ => false,
    };
    let in_qt_prefix = [
        &ctx.qt.install_libs,
        &ctx.qt.install_bins,
        &ctx.qt.install_prefix,
    ]
    .into_iter()
    .any(|root| root.as_ref().is_some_and(|r| lib_path.starts_with(r)));

    let path_str = lib_path.to_string_lossy();

    match kind {
        BinaryKind::Elf => {
            if path_str.starts_with("/lib") || path_str.starts_with("/usr/lib") {
                return is_qt_library_name(&base) || in_qt_prefix;
            }
            is_qt_library_name(&base) || in_qt_prefix || co_located
        }
        BinaryKind::Pe => {
            let lower = base.to_ascii_lowercase();
            if lower.starts_with("api-ms-win-") || lower.starts_with("ext-ms-win-") {
                return false;
            }
            if PE_SYSTEM_DLLS.contains(&lower.as_str()) {
                return false;
            }
            // /nix/store/ paths are a cross-build staging area, not host
            // system libraries.
            let in_nix_store = path_str.starts_with("/nix/store/");
            in_nix_store || is_qt_library_name(&base) || in_qt_prefix || co_located
        }
        BinaryKind::MachO => {
            if path_str.starts_with("/System/Library/Frameworks/")
                || path_str.starts_with("/usr/lib/")
            {
                return false;
            }
            is_qt_library_name(&base) || in_qt_prefix || co_located
        }
    }
}

/// Walk the transitive dependency graph of the main executable.
///
/// Depth-first over resolved imports; each canonical path is visited at
/// most once. An unresolvable Qt-named reference aborts the run; other
/// unresolvable references are assumed to be system libraries.
pub fn resolve_and_recurse(
    ctx: &ResolveContext,
    cache: &mut ParseCache,
) -> Result<Vec<PathBuf>, DeployError> {
    let plan = ctx.plan;
    let root_parsed = cache.parsed(&plan.binary_path, plan.kind).clone();

    let mut stack = Vec::new();
    push_resolved_deps(&plan.binary_path, &root_parsed, ctx, cache, &mut stack)?;

    let mut visited = HashSet::new();
    let mut libraries = Vec::new();
    while let Some(current) = stack.pop() {
        tracing::debug!("inspect {}", current.display());
        if !visited.insert(parse::canonical_key(&current)) {
            continue;
        }
        libraries.push(current.clone());

        let parsed = cache.parsed(&current, plan.kind).clone();
        push_resolved_deps(&current, &parsed, ctx, cache, &mut stack)?;
    }

    let subject_key = parse::canonical_key(&plan.binary_path);
    libraries.retain(|lib| parse::canonical_key(lib) != subject_key);
    Ok(libraries)
}

/// Walk the dependency graph seeded from already-staged plugin libraries,
/// returning every newly discovered library that passes the deploy policy.
/// The seeds themselves are not part of the result; they are already in
/// place.
pub fn resolve_dependencies_of(
    seeds: &[PathBuf],
    ctx: &ResolveContext,
    cache: &mut ParseCache,
) -> Vec<PathBuf> {
    let plan = ctx.plan;
    let mut stack: Vec<PathBuf> = seeds.to_vec();
    let mut visited = HashSet::new();
    let mut found_keys = HashSet::new();
    let mut found = Vec::new();

    while let Some(current) = stack.pop() {
        if !visited.insert(parse::canonical_key(&current)) {
            continue;
        }
        let parsed = cache.parsed(&current, plan.kind).clone();
        for dep in &parsed.dependencies {
            tracing::debug!("plugin dep {dep} of {}", current.display());
            let Some(resolved) = resolve_ref(
                plan.kind,
                dep,
                &current,
                &parsed,
                ctx,
                cache,
                &plan.binary_path,
            ) else {
                continue;
            };
            if !should_deploy_library(&resolved, plan.kind, ctx) {
                continue;
            }
            let key = parse::canonical_key(&resolved);
            if !visited.contains(&key) {
                stack.push(resolved.clone());
            }
            if found_keys.insert(key) {
                found.push(resolved);
            }
        }
    }

    found
}

fn push_resolved_deps(
    subject: &Path,
    parsed: &ParseResult,
    ctx: &ResolveContext,
    cache: &mut ParseCache,
    stack: &mut Vec<PathBuf>,
) -> Result<(), DeployError> {
    let plan = ctx.plan;
    for dep in &parsed.dependencies {
        match resolve_ref(plan.kind, dep, subject, parsed, ctx, cache, &plan.binary_path) {
            Some(resolved) => {
                if should_deploy_library(&resolved, plan.kind, ctx) {
                    tracing::debug!("push {}", resolved.display());
                    stack.push(resolved);
                }
            }
            None if is_qt_library_name(dep) => {
                return Err(DeployError::MissingQtLibrary(dep.clone()));
            }
            None => {}
        }
    }
    Ok(())
}
