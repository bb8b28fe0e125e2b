//! Deployment orchestration.
//!
//! Drives the stages in order for the detected format: layout skeleton,
//! library resolution and staging, main executable, overlays, PE prefix
//! patching, plugins, QML modules, translations, QML plugin dependencies,
//! and finally the Mach-O install-name fixup pass so it observes the
//! complete staged graph.

use std::path::PathBuf;

use crate::core::detect::BinaryKind;
use crate::core::parse::ParseCache;
use crate::core::plan::DeployPlan;
use crate::core::qt_paths;
use crate::core::resolve::{self, ResolveContext};
use crate::io::fsops;
use crate::ops::{linkedit, pe_patch, qml, stage, translations, DeployError};

/// Run the full deployment for `plan`.
pub fn deploy(plan: &DeployPlan) -> Result<(), DeployError> {
    fsops::ensure_output_layout(plan)?;

    let qt = qt_paths::query_qt_paths();
    let ctx = ResolveContext::prepare(plan, &qt);
    let mut cache = ParseCache::default();

    let libraries = resolve::resolve_and_recurse(&ctx, &mut cache)?;
    print_resolved(&libraries);

    stage::stage_libraries(plan, &libraries);
    stage::stage_main_binary(plan);
    fsops::apply_overlays(plan);

    if plan.kind == BinaryKind::Pe {
        patch_staged_qt_core(plan, &libraries);
    }

    stage::stage_plugins(&ctx, plan, &libraries);
    qml::stage_qml_modules(&ctx, plan);
    translations::stage_translations(&ctx, plan);
    qml::stage_qml_plugin_dependencies(&ctx, plan, &mut cache);

    if plan.kind == BinaryKind::MachO {
        linkedit::fix_install_names_macho(plan);
    }

    Ok(())
}

fn print_resolved(libraries: &[PathBuf]) {
    if libraries.is_empty() {
        return;
    }
    println!("Resolved shared libraries (filtered):");
    for library in libraries {
        println!("  {}", library.display());
    }
}

// Neutralize the build-host prefix strings embedded in the staged copy of
// Qt6Core.dll.
fn patch_staged_qt_core(plan: &DeployPlan, libraries: &[PathBuf]) {
    for library in libraries {
        let Some(name) = library.file_name() else { continue };
        if name.to_string_lossy().eq_ignore_ascii_case("qt6core.dll") {
            let staged = plan.output_root.join(name);
            if staged.exists() {
                tracing::debug!("patch prefix strings in {}", staged.display());
                if let Err(err) = pe_patch::patch_qt_core_prefixes(&staged) {
                    eprintln!(
                        "Warning: failed to patch {}: {err}",
                        staged.display()
                    );
                }
            }
            break;
        }
    }
}
