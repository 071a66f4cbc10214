//! Workspace file access and path conventions.
//!
//! All paths that cross component boundaries are workspace-relative and use
//! forward slashes, so fingerprints, payloads and filters agree on one form.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Directories that never contain indexable sources.
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", ".git", "vendor", "__pycache__", "dist"];

/// File access consumed by the orchestrator.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Workspace root all listed paths are relative to.
    fn root(&self) -> &Path;

    /// Workspace-relative paths of every indexable file.
    async fn list(&self) -> std::io::Result<Vec<String>>;

    /// Read a workspace-relative file.
    async fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;
}

/// Filesystem-backed workspace that honors `.gitignore`.
#[derive(Debug, Clone)]
pub struct WorkspaceFs {
    root: PathBuf,
    extensions: Vec<String>,
    max_file_size: u64,
    respect_gitignore: bool,
}

impl WorkspaceFs {
    pub fn new(root: PathBuf, extensions: Vec<String>, max_file_size: u64) -> Self {
        Self {
            root,
            extensions,
            max_file_size,
            respect_gitignore: true,
        }
    }

    pub fn with_gitignore(mut self, respect: bool) -> Self {
        self.respect_gitignore = respect;
        self
    }

    /// Whether a path carries one of the configured extensions.
    pub fn is_indexable(&self, path: &Path) -> bool {
        has_extension(path, &self.extensions)
    }

    fn walk(&self) -> Vec<String> {
        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(self.respect_gitignore)
            .git_global(self.respect_gitignore)
            .require_git(false)
            .build();

        let mut files = Vec::new();
        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() || !self.is_indexable(path) {
                continue;
            }
            let Some(relative) = to_relative(&self.root, path) else {
                continue;
            };
            if relative.split('/').any(|part| SKIPPED_DIRS.contains(&part)) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) if meta.len() > self.max_file_size => {
                    debug!("Skipping {} ({} bytes exceeds limit)", relative, meta.len());
                    continue;
                }
                _ => {}
            }
            files.push(relative);
        }
        files.sort();
        files
    }
}

#[async_trait]
impl FileSystem for WorkspaceFs {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn list(&self) -> std::io::Result<Vec<String>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.walk())
            .await
            .map_err(std::io::Error::other)
    }

    async fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.root.join(path)).await
    }
}

/// Check a path's extension against a list of extensions (without dots).
pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|e| e == ext))
        .unwrap_or(false)
}

/// SHA256 hex digest of file content.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Stable identifier for a workspace, derived from its absolute path.
///
/// Two checkouts of the same repository at different locations get
/// different identifiers.
pub fn workspace_hash(root: &Path) -> String {
    let absolute = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    content_hash(absolute.to_string_lossy().as_bytes())
}

/// Express `path` relative to `root` with forward slashes.
pub fn to_relative(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let joined = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Normalize a user-supplied relative path: forward slashes, no leading
/// `./` or `/`, no trailing slash.
pub fn normalize_relative(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let parts: Vec<&str> = unified
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    parts.join("/")
}

/// Parent directory of a workspace-relative path (`""` for top-level files).
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Extension of a workspace-relative path, or `"(none)"`.
pub fn extension_of(path: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_string())
        .unwrap_or_else(|| "(none)".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative("./src/utils/"), "src/utils");
        assert_eq!(normalize_relative("src\\utils\\a.ts"), "src/utils/a.ts");
        assert_eq!(normalize_relative("/src//lib"), "src/lib");
        assert_eq!(normalize_relative("."), "");
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("src/utils/a.ts"), "src/utils");
        assert_eq!(parent_dir("a.ts"), "");
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = content_hash(b"fn main() {}");
        let b = content_hash(b"fn main() {}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash(b"fn main() { }"));
    }

    #[test]
    fn test_workspace_hash_differs_by_location() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        assert_ne!(workspace_hash(a.path()), workspace_hash(b.path()));
        assert_eq!(workspace_hash(a.path()), workspace_hash(a.path()));
    }

    #[test]
    fn test_to_relative() {
        let root = Path::new("/work/repo");
        assert_eq!(
            to_relative(root, Path::new("/work/repo/src/main.rs")),
            Some("src/main.rs".to_string())
        );
        assert_eq!(to_relative(root, Path::new("/elsewhere/main.rs")), None);
    }

    #[tokio::test]
    async fn test_list_filters_extensions_and_skipped_dirs() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn a() {}").unwrap();
        fs::write(dir.path().join("src/notes.txt"), "notes").unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.ts"), "x").unwrap();
        fs::write(dir.path().join("app.ts"), "export const a = 1;").unwrap();

        let ws = WorkspaceFs::new(
            dir.path().to_path_buf(),
            vec!["rs".to_string(), "ts".to_string()],
            1024 * 1024,
        );
        let files = ws.list().await.unwrap();
        assert_eq!(files, vec!["app.ts".to_string(), "src/lib.rs".to_string()]);

        let content = ws.read("src/lib.rs").await.unwrap();
        assert_eq!(content, b"pub fn a() {}");
    }

    #[tokio::test]
    async fn test_list_skips_oversized_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("big.rs"), "x".repeat(2048)).unwrap();
        fs::write(dir.path().join("small.rs"), "fn a() {}").unwrap();

        let ws = WorkspaceFs::new(dir.path().to_path_buf(), vec!["rs".to_string()], 1024);
        let files = ws.list().await.unwrap();
        assert_eq!(files, vec!["small.rs".to_string()]);
    }
}
