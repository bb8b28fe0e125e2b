//! crossdeployqt - Cross-platform deployment packager for Qt applications
//!
//! Given a compiled executable in one of three binary formats (Windows PE,
//! Linux ELF, macOS Mach-O), produces a self-contained distribution directory
//! containing the executable together with every Qt shared library, plugin,
//! QML module, and translation catalog it needs to run without referencing
//! the build host's toolchain paths.

pub mod core;
pub mod io;
pub mod ops;
