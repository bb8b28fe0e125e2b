//! Dependency metadata extracted from external binary inspectors.
//!
//! Each format has its own inspector (`objdump -p` for ELF and PE,
//! `llvm-otool -L`/`-l` for Mach-O) whose line-based output is parsed
//! here. Parsing fails closed: a tool that cannot be run or exits
//! nonzero yields an empty [`ParseResult`], which the dependency walker
//! treats as a leaf.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use crate::core::detect::BinaryKind;
use crate::core::tools::{ELF_OBJDUMP, OTOOL, PE_OBJDUMP};
use crate::io::command::tool_stdout;

/// Import table of one binary, in import-table order, plus (ELF only)
/// its RPATH/RUNPATH entries.
#[derive(Debug, Default, Clone)]
pub struct ParseResult {
    pub dependencies: Vec<String>,
    pub rpaths: Vec<String>,
}

/// Memoizes inspector output by canonical subject path for one deploy run.
/// Mach-O LC_RPATH entries live in their own map because they require a
/// second `otool` invocation.
#[derive(Default)]
pub struct ParseCache {
    parsed: HashMap<String, ParseResult>,
    macho_rpaths: HashMap<String, Vec<String>>,
}

impl ParseCache {
    /// Parsed import metadata for `subject`, invoking the inspector on a
    /// cache miss.
    pub fn parsed(&mut self, subject: &Path, kind: BinaryKind) -> &ParseResult {
        let key = canonical_key(subject);
        self.parsed.entry(key).or_insert_with(|| match kind {
            BinaryKind::Pe => parse_pe(subject),
            BinaryKind::Elf => parse_elf(subject),
            BinaryKind::MachO => parse_macho(subject),
        })
    }

    /// LC_RPATH entries of a Mach-O subject.
    pub fn macho_rpaths(&mut self, subject: &Path) -> &[String] {
        let key = canonical_key(subject);
        self.macho_rpaths
            .entry(key)
            .or_insert_with(|| parse_macho_rpaths(subject))
    }

    #[cfg(test)]
    pub fn prime(&mut self, subject: &Path, result: ParseResult) {
        self.parsed.insert(canonical_key(subject), result);
    }

    #[cfg(test)]
    pub fn prime_macho_rpaths(&mut self, subject: &Path, rpaths: Vec<String>) {
        self.macho_rpaths.insert(canonical_key(subject), rpaths);
    }
}

/// Canonical form of a path, for cache keys and visited sets.
///
/// Canonicalization that fails (nonexistent path, permission denial) falls
/// back to a lexical cleanup so two distinct files are never silently
/// treated as one.
pub fn canonical_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| lexically_normalized(path))
}

/// String form of [`canonical_path`], used as a map/set key.
pub fn canonical_key(path: &Path) -> String {
    canonical_path(path).to_string_lossy().into_owned()
}

fn lexically_normalized(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !path.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn parse_pe(bin: &Path) -> ParseResult {
    match tool_stdout(PE_OBJDUMP, [OsStr::new("-p"), bin.as_os_str()]) {
        Some(out) => parse_pe_output(&out),
        None => ParseResult::default(),
    }
}

pub fn parse_elf(bin: &Path) -> ParseResult {
    match tool_stdout(ELF_OBJDUMP, [OsStr::new("-p"), bin.as_os_str()]) {
        Some(out) => parse_elf_output(&out),
        None => ParseResult::default(),
    }
}

pub fn parse_macho(bin: &Path) -> ParseResult {
    match tool_stdout(OTOOL, [OsStr::new("-L"), bin.as_os_str()]) {
        Some(out) => parse_macho_output(&out),
        None => ParseResult::default(),
    }
}

pub fn parse_macho_rpaths(bin: &Path) -> Vec<String> {
    match tool_stdout(OTOOL, [OsStr::new("-l"), bin.as_os_str()]) {
        Some(out) => parse_macho_rpaths_output(&out),
        None => Vec::new(),
    }
}

/// SONAME embedded in an ELF shared library, if any.
pub fn elf_soname(so_path: &Path) -> Option<String> {
    let out = tool_stdout(ELF_OBJDUMP, [OsStr::new("-p"), so_path.as_os_str()])?;
    parse_soname_output(&out)
}

/// Install-id and import list of a Mach-O dylib: the first token line of
/// `otool -L` is the dylib's own id, the rest are its imports.
pub fn macho_id_and_deps(bin: &Path) -> (Option<String>, Vec<String>) {
    match tool_stdout(OTOOL, [OsStr::new("-L"), bin.as_os_str()]) {
        Some(out) => parse_macho_id_output(&out),
        None => (None, Vec::new()),
    }
}

fn parse_pe_output(out: &str) -> ParseResult {
    let mut result = ParseResult::default();
    for line in out.lines() {
        if let Some((_, rest)) = line.split_once("DLL Name:") {
            let name = rest.trim();
            if !name.is_empty() {
                result.dependencies.push(name.to_string());
            }
        }
    }
    result
}

fn parse_elf_output(out: &str) -> ParseResult {
    let mut result = ParseResult::default();
    for line in out.lines() {
        if line.contains("NEEDED") {
            if let Some(name) = last_token(line, "NEEDED") {
                result.dependencies.push(name.to_string());
            }
        }
        if line.contains("RPATH") || line.contains("RUNPATH") {
            let tag = if line.contains("RUNPATH") { "RUNPATH" } else { "RPATH" };
            if let Some(paths) = last_token(line, tag) {
                result
                    .rpaths
                    .extend(paths.split(':').filter(|p| !p.is_empty()).map(String::from));
            }
        }
    }
    result
}

// The last whitespace-delimited token of a tag line, or None when the line
// carries only the tag itself.
fn last_token<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    line.split_whitespace().last().filter(|tok| *tok != tag)
}

fn parse_macho_output(out: &str) -> ParseResult {
    let mut result = ParseResult::default();
    // First line is the subject's own name.
    for line in out.lines().skip(1) {
        if let Some(token) = leading_token(line) {
            result.dependencies.push(token.to_string());
        }
    }
    result
}

// First whitespace-delimited token of an otool -L entry, stopping at the
// "(compatibility version ...)" suffix.
fn leading_token(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let end = trimmed
        .find(|c: char| c.is_whitespace() || c == '(')
        .unwrap_or(trimmed.len());
    let token = &trimmed[..end];
    (!token.is_empty()).then_some(token)
}

fn parse_macho_rpaths_output(out: &str) -> Vec<String> {
    let mut rpaths = Vec::new();
    let mut in_rpath_cmd = false;
    for line in out.lines() {
        if line.contains("cmd LC_RPATH") {
            in_rpath_cmd = true;
            continue;
        }
        if in_rpath_cmd {
            if let Some((_, rest)) = line.split_once("path ") {
                let path = match rest.find(" (") {
                    Some(paren) => &rest[..paren],
                    None => rest,
                };
                let path = path.trim();
                if !path.is_empty() {
                    rpaths.push(path.to_string());
                }
                in_rpath_cmd = false;
            }
        }
    }
    rpaths
}

fn parse_soname_output(out: &str) -> Option<String> {
    for line in out.lines() {
        if line.contains("SONAME") {
            if let Some(name) = last_token(line, "SONAME") {
                return Some(name.to_string());
            }
        }
    }
    None
}

fn parse_macho_id_output(out: &str) -> (Option<String>, Vec<String>) {
    let mut id = None;
    let mut deps = Vec::new();
    for line in out.lines().skip(1) {
        let Some(token) = leading_token(line) else {
            continue;
        };
        if id.is_none() {
            id = Some(token.to_string());
        } else {
            deps.push(token.to_string());
        }
    }
    (id, deps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pe_output_extracts_dll_names() {
        let out = "\
There is an import table in .idata at 0x140010000

The Import Tables (interpreted .idata section contents)
\tDLL Name: Qt6Core.dll
\tvma:  Hint/Ord Member-Name
\tDLL Name: KERNEL32.dll
";
        let result = parse_pe_output(out);
        assert_eq!(result.dependencies, vec!["Qt6Core.dll", "KERNEL32.dll"]);
        assert!(result.rpaths.is_empty());
    }

    #[test]
    fn elf_output_extracts_needed_and_runpath() {
        let out = "\
Dynamic Section:
  NEEDED               libQt6Core.so.6
  NEEDED               libc.so.6
  RUNPATH              /opt/qt/lib:$ORIGIN/../lib
  SONAME               libapp.so.1
";
        let result = parse_elf_output(out);
        assert_eq!(
            result.dependencies,
            vec!["libQt6Core.so.6", "libc.so.6"]
        );
        assert_eq!(result.rpaths, vec!["/opt/qt/lib", "$ORIGIN/../lib"]);
    }

    #[test]
    fn elf_bare_tag_line_is_ignored() {
        let result = parse_elf_output("  NEEDED\n  RUNPATH\n");
        assert!(result.dependencies.is_empty());
        assert!(result.rpaths.is_empty());
    }

    #[test]
    fn macho_output_skips_subject_line() {
        let out = "\
/opt/app/MyApp:
\t@rpath/QtCore.framework/Versions/A/QtCore (compatibility version 6.0.0, current version 6.5.0)
\t/usr/lib/libSystem.B.dylib (compatibility version 1.0.0, current version 1319.0.0)
";
        let result = parse_macho_output(out);
        assert_eq!(
            result.dependencies,
            vec![
                "@rpath/QtCore.framework/Versions/A/QtCore",
                "/usr/lib/libSystem.B.dylib"
            ]
        );
    }

    #[test]
    fn macho_rpaths_follow_lc_rpath_commands() {
        let out = "\
Load command 12
          cmd LC_RPATH
      cmdsize 40
         path @executable_path/../Frameworks (offset 12)
Load command 13
          cmd LC_LOAD_DYLIB
         path /not/an/rpath (offset 12)
Load command 14
          cmd LC_RPATH
      cmdsize 32
         path /opt/qt/lib (offset 12)
";
        assert_eq!(
            parse_macho_rpaths_output(out),
            vec!["@executable_path/../Frameworks", "/opt/qt/lib"]
        );
    }

    #[test]
    fn soname_is_last_token() {
        let out = "  SONAME               libQt6Core.so.6\n";
        assert_eq!(parse_soname_output(out).as_deref(), Some("libQt6Core.so.6"));
        assert_eq!(parse_soname_output("  FLAGS  BIND_NOW\n"), None);
    }

    #[test]
    fn macho_id_line_precedes_imports() {
        let out = "\
/opt/qt/lib/QtCore.framework/Versions/A/QtCore:
\t/opt/qt/lib/QtCore.framework/Versions/A/QtCore (compatibility version 6.0.0)
\t/usr/lib/libc++.1.dylib (compatibility version 1.0.0)
";
        let (id, deps) = parse_macho_id_output(out);
        assert_eq!(
            id.as_deref(),
            Some("/opt/qt/lib/QtCore.framework/Versions/A/QtCore")
        );
        assert_eq!(deps, vec!["/usr/lib/libc++.1.dylib"]);
    }

    #[test]
    fn garbage_output_parses_to_empty() {
        assert!(parse_pe_output("not objdump output").dependencies.is_empty());
        assert!(parse_elf_output("???").dependencies.is_empty());
        assert!(parse_macho_rpaths_output("").is_empty());
    }

    #[test]
    fn lexical_normalization_folds_dots() {
        assert_eq!(
            lexically_normalized(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(lexically_normalized(Path::new("a/../..")), PathBuf::from(".."));
    }

    #[test]
    fn canonical_key_distinguishes_missing_files() {
        let a = canonical_key(Path::new("/nonexistent/one"));
        let b = canonical_key(Path::new("/nonexistent/two"));
        assert_ne!(a, b);
    }
}
