//! Shared directory: enumerate advertised files and map requested names back to paths.

use std::io;
use std::path::{Component, Path, PathBuf};

use shoal_core::FileName;
use tracing::warn;

/// Recursively list regular files under `root` as `/`-separated names relative
/// to `root`, sorted. Names that do not fit the wire field are skipped.
pub fn shared_files(root: &Path) -> io::Result<Vec<FileName>> {
    let real_root = std::fs::canonicalize(root)?;
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    let mut first = true;
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if first => return Err(e),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };
        first = false;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            // symlinks count when they point at a regular file inside the root
            let is_file = file_type.is_file()
                || (file_type.is_symlink()
                    && std::fs::canonicalize(&path)
                        .map(|real| real.starts_with(&real_root) && real.is_file())
                        .unwrap_or(false));
            if !is_file {
                continue;
            }
            match relative_name(root, &path) {
                Some(name) => match FileName::new(name.clone()) {
                    Ok(file) => out.push(file),
                    Err(e) => warn!(file = %name, error = %e, "not advertising file"),
                },
                None => warn!(path = %path.display(), "not advertising non UTF-8 path"),
            }
        }
    }
    out.sort();
    Ok(out)
}

/// [`shared_files`] off the async runtime.
pub async fn list_shared(root: &Path) -> io::Result<Vec<FileName>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || shared_files(&root))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

/// Map a requested name to a path inside `root`. Rejects anything that could
/// escape the shared directory.
pub fn resolve(root: &Path, name: &FileName) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for part in name.as_str().split('/') {
        if part.is_empty() || part.contains('\\') {
            return None;
        }
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(c)), None) => path.push(c),
            _ => return None,
        }
    }
    Some(path)
}

/// Resolve `name` to a regular file whose real path, symlinks followed, is
/// still inside `root`. Returns the canonical path.
pub async fn locate(root: &Path, name: &FileName) -> Option<PathBuf> {
    let path = resolve(root, name)?;
    let real_root = tokio::fs::canonicalize(root).await.ok()?;
    let real = tokio::fs::canonicalize(&path).await.ok()?;
    if !real.starts_with(&real_root) {
        warn!(file = %name, path = %real.display(), "refusing path outside shared directory");
        return None;
    }
    let meta = tokio::fs::metadata(&real).await.ok()?;
    meta.is_file().then_some(real)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> FileName {
        FileName::new(s).unwrap()
    }

    #[test]
    fn lists_nested_files_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/deep")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"n").unwrap();
        std::fs::write(dir.path().join("docs/a.md"), b"a").unwrap();
        std::fs::write(dir.path().join("docs/deep/b.bin"), b"b").unwrap();
        std::fs::write(dir.path().join("x".repeat(40)), b"too long").unwrap();

        let files = shared_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![name("docs/a.md"), name("docs/deep/b.bin"), name("notes.txt")]
        );
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(shared_files(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn resolve_stays_inside_root() {
        let root = Path::new("/srv/shared");
        assert_eq!(
            resolve(root, &name("docs/a.md")),
            Some(PathBuf::from("/srv/shared/docs/a.md"))
        );
        assert_eq!(resolve(root, &name("../etc/passwd")), None);
        assert_eq!(resolve(root, &name("/etc/passwd")), None);
        assert_eq!(resolve(root, &name("docs//a.md")), None);
        assert_eq!(resolve(root, &name("./a.md")), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_out_of_root_are_neither_listed_nor_located() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"top secret").unwrap();
        let shared = tempfile::tempdir().unwrap();
        std::fs::write(shared.path().join("inside.txt"), b"ok").unwrap();
        std::os::unix::fs::symlink(outside.path(), shared.path().join("link")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            shared.path().join("alias.txt"),
        )
        .unwrap();
        std::os::unix::fs::symlink(shared.path().join("inside.txt"), shared.path().join("same.txt"))
            .unwrap();

        let files = shared_files(shared.path()).unwrap();
        assert_eq!(files, vec![name("inside.txt"), name("same.txt")]);

        assert!(locate(shared.path(), &name("link/secret.txt")).await.is_none());
        assert!(locate(shared.path(), &name("alias.txt")).await.is_none());
        assert!(locate(shared.path(), &name("same.txt")).await.is_some());
        assert!(locate(shared.path(), &name("link")).await.is_none());
    }
}
