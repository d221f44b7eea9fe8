//! Compiler argument assembly and include-path hygiene.
//!
//! Interpreter backends detect system include directories themselves, and
//! that detection is known to emit corrupted or stale entries. Every path
//! handed to the backend goes through [`sanitize_include_paths`] first.

use std::path::Path;

/// Well-known system include directories, probed when detection yields
/// nothing usable.
const FALLBACK_INCLUDE_DIRS: &[&str] = &[
    "/Library/Developer/CommandLineTools/SDKs/MacOSX.sdk/usr/include/c++/v1",
    "/Library/Developer/CommandLineTools/usr/lib/clang/17/include",
    "/Library/Developer/CommandLineTools/SDKs/MacOSX.sdk/usr/include",
    "/usr/include/c++/v1",
    "/usr/include",
    "/usr/local/include",
];

/// Environment variable naming the compiler resource directory.
pub const RESOURCE_DIR_ENV: &str = "OUTPOST_RESOURCE_DIR";

/// Filter a detected include-path list down to entries that are safe to
/// hand to a compiler.
///
/// A path survives only if it is at least 3 bytes long, free of NUL and
/// control bytes (newline and tab excepted), absolute, and names an
/// existing directory. Everything else is logged and dropped.
pub fn sanitize_include_paths(paths: &[String]) -> Vec<String> {
    let mut sanitized = Vec::with_capacity(paths.len());

    for path in paths {
        if path.len() < 3 {
            tracing::warn!(path = %path, "dropping include path: too short");
            continue;
        }
        if path
            .chars()
            .any(|c| c == '\0' || ((c as u32) < 32 && c != '\n' && c != '\t'))
        {
            tracing::warn!(path = %path, "dropping include path: control bytes");
            continue;
        }
        if !path.starts_with('/') {
            tracing::warn!(path = %path, "dropping include path: not absolute");
            continue;
        }
        if !Path::new(path).is_dir() {
            tracing::warn!(path = %path, "dropping include path: not a directory");
            continue;
        }
        sanitized.push(path.clone());
    }

    sanitized
}

/// System include directories present on this machine.
pub fn detect_system_include_paths() -> Vec<String> {
    FALLBACK_INCLUDE_DIRS
        .iter()
        .filter(|path| Path::new(path).is_dir())
        .map(|path| (*path).to_string())
        .collect()
}

/// The compiler resource directory, when one is configured and valid.
pub fn detect_resource_dir() -> Option<String> {
    let dir = std::env::var(RESOURCE_DIR_ENV).ok()?;
    if !dir.is_empty() && Path::new(&dir).is_dir() {
        Some(dir)
    } else {
        tracing::warn!(dir = %dir, "ignoring invalid resource directory");
        None
    }
}

/// Assemble the interpreter's compiler-argument vector.
///
/// `-g -O0`, the resource directory when detected, then one `-isystem` pair
/// per validated system include path.
pub fn compiler_args() -> Vec<String> {
    let mut args = vec!["-g".to_string(), "-O0".to_string()];

    if let Some(resource_dir) = detect_resource_dir() {
        tracing::info!(dir = %resource_dir, "using resource directory");
        args.push("-resource-dir".to_string());
        args.push(resource_dir);
    }

    let detected = detect_system_include_paths();
    tracing::debug!(count = detected.len(), "detected system include paths");
    for include in sanitize_include_paths(&detected) {
        args.push("-isystem".to_string());
        args.push(include);
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_existing_absolute_directories() {
        let paths = vec!["/tmp".to_string()];
        assert_eq!(sanitize_include_paths(&paths), paths);
    }

    #[test]
    fn sanitize_drops_short_relative_and_missing_paths() {
        let paths = vec![
            "ab".to_string(),
            "relative/include".to_string(),
            "/definitely/not/present/xyzzy".to_string(),
        ];
        assert!(sanitize_include_paths(&paths).is_empty());
    }

    #[test]
    fn sanitize_drops_paths_with_control_bytes() {
        let paths = vec!["/usr/inc\u{1}lude".to_string(), "/tmp\0".to_string()];
        assert!(sanitize_include_paths(&paths).is_empty());
    }

    #[test]
    fn compiler_args_start_with_debug_flags() {
        let args = compiler_args();
        assert_eq!(&args[..2], &["-g".to_string(), "-O0".to_string()]);
        // -isystem flags always pair with a path
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == "-isystem" {
                let path = iter.next().expect("-isystem must carry a path");
                assert!(path.starts_with('/'));
            }
        }
    }
}
