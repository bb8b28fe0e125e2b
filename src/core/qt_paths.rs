//! Qt installation roots queried from qtpaths.

use std::path::PathBuf;

use crate::core::tools;
use crate::io::command::tool_stdout;

/// The six Qt install roots the deployment draws from.
///
/// A root the query tool could not report, or (for the plugin, QML, and
/// translation roots) one that does not exist on disk, is `None` so
/// downstream code falls back to environment-derived paths.
#[derive(Debug, Default, Clone)]
pub struct QtPaths {
    pub install_libs: Option<PathBuf>,
    pub install_bins: Option<PathBuf>,
    pub install_prefix: Option<PathBuf>,
    pub install_plugins: Option<PathBuf>,
    pub install_qml: Option<PathBuf>,
    pub install_translations: Option<PathBuf>,
}

/// Query the Qt install roots. Failure to invoke qtpaths is not fatal;
/// the result is merely empty and callers work with partial information.
pub fn query_qt_paths() -> QtPaths {
    let program = tools::qtpaths_program();
    let query = |what: &str| -> Option<PathBuf> {
        let out = tool_stdout(&program, ["--query", what])?;
        let trimmed = out.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    };

    let mut paths = QtPaths {
        install_libs: query("QT_INSTALL_LIBS"),
        install_bins: query("QT_INSTALL_BINS"),
        install_prefix: query("QT_INSTALL_PREFIX"),
        install_plugins: query("QT_INSTALL_PLUGINS"),
        install_qml: query("QT_INSTALL_QML"),
        install_translations: query("QT_INSTALL_TRANSLATIONS"),
    };

    for root in [
        &mut paths.install_plugins,
        &mut paths.install_qml,
        &mut paths.install_translations,
    ] {
        if root.as_ref().is_some_and(|p| !p.exists()) {
            *root = None;
        }
    }

    paths
}
