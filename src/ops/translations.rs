//! Translation catalog staging.
//!
//! For each selected language, the per-module Qt catalogs
//! (`qtbase_de.qm`, `qtdeclarative_de.qm`, ...) are aggregated into a
//! single `qt_de.qm` with `lconvert`; if aggregation fails they are copied
//! verbatim instead.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::detect::BinaryKind;
use crate::core::plan::DeployPlan;
use crate::core::resolve::ResolveContext;
use crate::core::tools::LCONVERT;
use crate::io::command::run_tool;
use crate::io::fsops;

fn translations_output_dir(plan: &DeployPlan) -> PathBuf {
    match plan.kind {
        BinaryKind::MachO => plan.output_root.join("Contents/Resources/translations"),
        BinaryKind::Elf => plan.output_root.join("usr/translations"),
        BinaryKind::Pe => plan.output_root.join("translations"),
    }
}

// "ll[_CC][.codeset][@modifier]" -> lowercased "ll"
fn parse_locale(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let end = value.find(['_', '.', '@', ' ']).unwrap_or(value.len());
    let base = &value[..end];
    (!base.is_empty()).then(|| base.to_ascii_lowercase())
}

fn languages_from_env() -> Vec<String> {
    let lc_all = std::env::var("LC_ALL").unwrap_or_default();
    let lang = std::env::var("LANG").unwrap_or_default();
    let pick = if lc_all.is_empty() { lang } else { lc_all };

    let mut languages: Vec<String> = parse_locale(&pick).into_iter().collect();
    // English ships as the fallback catalog.
    if !languages.iter().any(|l| l == "en") {
        languages.push("en".to_string());
    }
    languages
}

fn compute_languages(plan: &DeployPlan) -> Vec<String> {
    if plan.languages.is_empty() {
        languages_from_env()
    } else {
        plan.languages.clone()
    }
}

/// Every catalog in the Qt translations directory for one language,
/// matched by the `_<lang>.qm` basename suffix.
fn catalogs_for_language(translations_dir: &Path, lang: &str) -> Vec<PathBuf> {
    let suffix = format!("_{lang}.qm");
    let Ok(entries) = fs::read_dir(translations_dir) else {
        return Vec::new();
    };
    let mut catalogs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|name| name.len() > suffix.len() && name.ends_with(&suffix))
        })
        .collect();
    catalogs.sort();
    catalogs
}

fn aggregate_catalogs(inputs: &[PathBuf], output: &Path) -> bool {
    if inputs.is_empty() {
        return false;
    }
    let mut args: Vec<OsString> = vec![OsString::from("-o"), output.into()];
    for input in inputs {
        args.push(OsString::from("-i"));
        args.push(input.into());
    }
    match run_tool(LCONVERT, &args) {
        Ok(out) => out.success && output.exists(),
        Err(_) => false,
    }
}

/// Stage the translation catalogs for the selected languages.
pub fn stage_translations(ctx: &ResolveContext, plan: &DeployPlan) {
    let Some(qt_translations) = &ctx.qt.install_translations else {
        return;
    };
    let languages = compute_languages(plan);
    let out_dir = translations_output_dir(plan);
    if let Err(err) = fs::create_dir_all(&out_dir) {
        eprintln!(
            "Warning: failed to create translations directory {}: {err}",
            out_dir.display()
        );
        return;
    }

    for lang in &languages {
        let catalogs = catalogs_for_language(qt_translations, lang);
        if catalogs.is_empty() {
            continue;
        }
        let aggregated = out_dir.join(format!("qt_{lang}.qm"));
        tracing::debug!("aggregate {} catalogs -> {}", catalogs.len(), aggregated.display());
        if !aggregate_catalogs(&catalogs, &aggregated) {
            for catalog in &catalogs {
                let Some(name) = catalog.file_name() else { continue };
                fsops::copy_file_or_warn(catalog, &out_dir.join(name));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn locale_strings_reduce_to_language_code() {
        assert_eq!(parse_locale("de_DE.UTF-8").as_deref(), Some("de"));
        assert_eq!(parse_locale("fr_FR@euro").as_deref(), Some("fr"));
        assert_eq!(parse_locale("C.UTF-8").as_deref(), Some("c"));
        assert_eq!(parse_locale("EN").as_deref(), Some("en"));
        assert_eq!(parse_locale(""), None);
        assert_eq!(parse_locale("_US"), None);
    }

    #[test]
    fn catalogs_match_language_suffix() {
        let dir = tempdir().unwrap();
        for name in [
            "qtbase_de.qm",
            "qtdeclarative_de.qm",
            "qtbase_fr.qm",
            "qtbase_de.ts",
            "_de.qm",
        ] {
            fs::write(dir.path().join(name), b"qm").unwrap();
        }
        let catalogs = catalogs_for_language(dir.path(), "de");
        let names: Vec<_> = catalogs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        // The bare "_de.qm" has no module prefix and is excluded.
        assert_eq!(names, vec!["qtbase_de.qm", "qtdeclarative_de.qm"]);
    }

    #[test]
    fn missing_translations_dir_lists_nothing() {
        assert!(catalogs_for_language(Path::new("/nonexistent"), "de").is_empty());
    }

    #[test]
    fn requested_languages_override_environment() {
        let plan = DeployPlan {
            kind: BinaryKind::Elf,
            binary_path: PathBuf::from("/build/app"),
            output_root: PathBuf::from("/tmp/out"),
            qml_roots: Vec::new(),
            languages: vec!["de".to_string(), "fr".to_string()],
            overlays: Vec::new(),
        };
        assert_eq!(compute_languages(&plan), vec!["de", "fr"]);
    }
}
