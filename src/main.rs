//! crossdeployqt - Qt deployment packager CLI

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crossdeployqt::core::detect;
use crossdeployqt::core::plan::DeployPlan;
use crossdeployqt::core::tools;
use crossdeployqt::ops::{self, DeployError};

/// Deploy a compiled Qt application into a self-contained distribution
/// directory, together with the Qt libraries, plugins, QML modules, and
/// translations it needs.
#[derive(Parser)]
#[command(name = "crossdeployqt", version)]
struct Cli {
    /// Application binary to deploy (PE, ELF, or Mach-O)
    #[arg(long = "bin", value_name = "PATH")]
    binary: PathBuf,

    /// Output directory root
    #[arg(long = "out", value_name = "DIR")]
    out: PathBuf,

    /// Extra QML source root to scan (repeatable)
    #[arg(long = "qml-root", value_name = "DIR")]
    qml_roots: Vec<PathBuf>,

    /// Translation languages, comma separated (default: LC_ALL/LANG plus en)
    #[arg(long, value_name = "LANGS", value_delimiter = ',')]
    languages: Vec<String>,

    /// Overlay directory merged into the output root (repeatable)
    #[arg(long = "overlay", value_name = "DIR")]
    overlays: Vec<PathBuf>,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<(), DeployError> {
    if !cli.binary.exists() {
        return Err(DeployError::InvalidInput(format!(
            "binary does not exist: {}",
            cli.binary.display()
        )));
    }
    if !cli.binary.is_file() {
        return Err(DeployError::InvalidInput(format!(
            "binary path is not a file: {}",
            cli.binary.display()
        )));
    }

    let kind = detect::detect_binary_kind(&cli.binary)?;
    println!("Detected: {kind}");

    let missing = tools::missing_tools(kind);
    if !missing.is_empty() {
        return Err(DeployError::MissingTools(missing.join(", ")));
    }

    let plan = DeployPlan::new(
        kind,
        cli.binary,
        cli.out,
        cli.qml_roots,
        cli.languages,
        cli.overlays,
    );
    ops::deploy::deploy(&plan)?;

    println!("Deploy complete at: {}", plan.output_root.display());
    Ok(())
}

fn init_tracing() {
    let filter = if std::env::var_os("CROSSDEPLOYQT_VERBOSE").is_some_and(|v| !v.is_empty()) {
        EnvFilter::new("crossdeployqt=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
