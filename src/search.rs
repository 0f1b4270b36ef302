//! Search-Path Resolver: fixed, documented precedence. No
//! current-working-directory or `PATH` search.

use std::path::{Path, PathBuf};

/// Resolves `name` (e.g. `"kernel32.dll"`) to a file on disk, trying:
/// 1. each recorded client-library directory, in insertion order;
/// 2. `{system_root}/system32/{name}`;
/// 3. `{system_root}/{name}`.
///
/// Returns the first candidate that exists; `None` if none does.
pub fn resolve(name: &str, client_dirs: &[PathBuf], system_root: &Path) -> Option<PathBuf> {
    for dir in client_dirs {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    let system32 = system_root.join("system32").join(name);
    if system32.is_file() {
        return Some(system32);
    }

    let root = system_root.join(name);
    if root.is_file() {
        return Some(root);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn client_dir_takes_precedence_over_system_root() {
        let tmp = std::env::temp_dir().join(format!("privldr-test-{}", std::process::id()));
        let client = tmp.join("client");
        let sysroot = tmp.join("sysroot");
        fs::create_dir_all(client.join("x")).unwrap();
        fs::create_dir_all(sysroot.join("system32")).unwrap();
        fs::write(client.join("foo.dll"), b"client").unwrap();
        fs::write(sysroot.join("system32").join("foo.dll"), b"system").unwrap();

        let found = resolve("foo.dll", &[client.clone()], &sysroot).unwrap();
        assert_eq!(found, client.join("foo.dll"));

        fs::remove_dir_all(&tmp).unwrap();
    }

    #[test]
    fn falls_back_to_system32_then_root() {
        let tmp = std::env::temp_dir().join(format!("privldr-test2-{}", std::process::id()));
        let sysroot = tmp.join("sysroot");
        fs::create_dir_all(sysroot.join("system32")).unwrap();
        fs::write(sysroot.join("bar.dll"), b"root").unwrap();

        let found = resolve("bar.dll", &[], &sysroot).unwrap();
        assert_eq!(found, sysroot.join("bar.dll"));

        fs::remove_dir_all(&tmp).unwrap();
    }

    #[test]
    fn missing_file_resolves_to_none() {
        let sysroot = std::env::temp_dir().join("privldr-test-missing-root");
        assert!(resolve("does-not-exist.dll", &[], &sysroot).is_none());
    }
}
