//! 沙箱文件系统
//!
//! SafeFs 绑定 root_dir，所有路径必须解析到 root 之下（禁止 ../ 与符号链接逃逸）；
//! 另有危险扩展名黑名单与单文件大小上限。读 / 写 / 列目录 / 搜索均为同步操作，
//! 由 ToolFacade 放到 spawn_blocking 中执行。

use std::collections::HashSet;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::core::ToolError;

/// 内容搜索只扫描不超过该大小的文件
pub const CONTENT_SEARCH_MAX_BYTES: u64 = 1024 * 1024;

/// 读取结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileContent {
    pub path: String,
    pub size: u64,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    pub path: String,
    pub bytes_written: u64,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

/// 目录条目；path 相对于沙箱根
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Filename,
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub path: String,
    pub name: String,
    pub kind: MatchKind,
    pub size: u64,
}

/// 沙箱文件系统：绑定根目录，校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
    max_file_bytes: u64,
    blocked_extensions: HashSet<String>,
}

impl SafeFs {
    /// 根目录不存在时自动创建
    pub fn new(
        root_dir: impl AsRef<Path>,
        max_file_bytes: u64,
        blocked_extensions: &[String],
    ) -> Result<Self, ToolError> {
        let root = root_dir.as_ref();
        std::fs::create_dir_all(root).map_err(|e| ToolError::Io(e.to_string()))?;
        let root_dir = root
            .canonicalize()
            .map_err(|e| ToolError::Io(e.to_string()))?;
        Ok(Self {
            root_dir,
            max_file_bytes,
            blocked_extensions: blocked_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    fn is_blocked(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.blocked_extensions.contains(&e.to_lowercase()))
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// 拒绝绝对路径与 .. 分量，得到根下的词法路径
    fn lexical(&self, path: &str) -> Result<PathBuf, ToolError> {
        let trimmed = path.trim().trim_start_matches("./");
        let candidate = Path::new(trimmed);
        let mut out = self.root_dir.clone();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                _ => return Err(ToolError::AccessDenied(path.to_string())), // 如 ../../etc/passwd
            }
        }
        Ok(out)
    }

    /// 解析已存在的路径（跟随符号链接后仍须在根下）
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let full = self.lexical(path)?;
        let canonical = full
            .canonicalize()
            .map_err(|_| ToolError::NotFound(path.to_string()))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(ToolError::AccessDenied(path.to_string()))
        }
    }

    /// 解析写入目标：文件可以不存在，但最近的已存在祖先必须在根下
    fn resolve_for_write(&self, path: &str) -> Result<PathBuf, ToolError> {
        let full = self.lexical(path)?;
        if full == self.root_dir {
            return Err(ToolError::InvalidArguments("path must name a file".into()));
        }
        let mut ancestor = full.as_path();
        while !ancestor.exists() {
            ancestor = ancestor
                .parent()
                .ok_or_else(|| ToolError::AccessDenied(path.to_string()))?;
        }
        let canonical = ancestor
            .canonicalize()
            .map_err(|e| ToolError::Io(e.to_string()))?;
        if !canonical.starts_with(&self.root_dir) {
            return Err(ToolError::AccessDenied(path.to_string()));
        }
        Ok(full)
    }

    pub fn read_file(&self, path: &str) -> Result<FileContent, ToolError> {
        let resolved = self.resolve(path)?;
        if self.is_blocked(&resolved) {
            return Err(ToolError::AccessDenied(format!("blocked file type: {}", path)));
        }
        let meta = std::fs::metadata(&resolved).map_err(|e| ToolError::Io(e.to_string()))?;
        if !meta.is_file() {
            return Err(ToolError::InvalidArguments(format!("not a file: {}", path)));
        }
        if meta.len() > self.max_file_bytes {
            return Err(ToolError::InvalidArguments(format!(
                "file too large: {} bytes (max {})",
                meta.len(),
                self.max_file_bytes
            )));
        }
        let content = std::fs::read_to_string(&resolved)
            .map_err(|e| ToolError::Io(format!("Read failed: {}", e)))?;
        Ok(FileContent {
            path: self.relative(&resolved),
            size: meta.len(),
            content,
        })
    }

    /// 写入：先写同目录临时文件再 rename，失败时原文件不受影响
    pub fn write_file(&self, path: &str, content: &str) -> Result<WriteResult, ToolError> {
        let target = self.resolve_for_write(path)?;
        if self.is_blocked(&target) {
            return Err(ToolError::AccessDenied(format!("blocked file type: {}", path)));
        }
        if content.len() as u64 > self.max_file_bytes {
            return Err(ToolError::InvalidArguments(format!(
                "content too large: {} bytes (max {})",
                content.len(),
                self.max_file_bytes
            )));
        }
        if target.is_dir() {
            return Err(ToolError::InvalidArguments(format!("is a directory: {}", path)));
        }
        let created = !target.exists();
        let parent = target
            .parent()
            .ok_or_else(|| ToolError::AccessDenied(path.to_string()))?;
        std::fs::create_dir_all(parent).map_err(|e| ToolError::Io(e.to_string()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| ToolError::Io(e.to_string()))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| ToolError::Io(format!("Write failed: {}", e)))?;
        tmp.persist(&target)
            .map_err(|e| ToolError::Io(format!("Write failed: {}", e.error)))?;

        Ok(WriteResult {
            path: self.relative(&target),
            bytes_written: content.len() as u64,
            created,
        })
    }

    /// 列目录：目录在前，其次按名称（不区分大小写）排序；默认跳过隐藏项
    pub fn list_files(
        &self,
        path: &str,
        recursive: bool,
        include_hidden: bool,
    ) -> Result<Vec<FileEntry>, ToolError> {
        let base = self.dir(path)?;
        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut entries = Vec::new();
        let walker = WalkDir::new(&base)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| include_hidden || !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = entry.map_err(|e| ToolError::Io(e.to_string()))?;
            let meta = entry.metadata().map_err(|e| ToolError::Io(e.to_string()))?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                path: self.relative(entry.path()),
                kind: if meta.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        entries.sort_by(|a, b| {
            (a.kind != EntryKind::Directory, a.name.to_lowercase())
                .cmp(&(b.kind != EntryKind::Directory, b.name.to_lowercase()))
        });
        Ok(entries)
    }

    /// 按文件名搜索（支持 glob 通配符，否则为不区分大小写的子串），可选按内容搜索
    pub fn search_files(
        &self,
        path: &str,
        pattern: &str,
        content_search: bool,
    ) -> Result<Vec<SearchMatch>, ToolError> {
        if pattern.trim().is_empty() {
            return Err(ToolError::InvalidArguments("pattern must not be empty".into()));
        }
        let base = self.dir(path)?;
        let needle = pattern.to_lowercase();
        let glob_pattern = if pattern.contains(['*', '?', '[']) {
            Some(
                glob::Pattern::new(pattern)
                    .map_err(|e| ToolError::InvalidArguments(format!("invalid pattern: {}", e)))?,
            )
        } else {
            None
        };

        let mut matches = Vec::new();
        let walker = WalkDir::new(&base)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || self.is_blocked(entry.path()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let name_hit = match &glob_pattern {
                Some(p) => p.matches(&name),
                None => name.to_lowercase().contains(&needle),
            };
            if name_hit {
                matches.push(SearchMatch {
                    path: self.relative(entry.path()),
                    name,
                    kind: MatchKind::Filename,
                    size,
                });
                continue;
            }
            if content_search && size <= CONTENT_SEARCH_MAX_BYTES {
                // 非 UTF-8 文件视为二进制，跳过
                if let Ok(text) = std::fs::read_to_string(entry.path()) {
                    if text.to_lowercase().contains(&needle) {
                        matches.push(SearchMatch {
                            path: self.relative(entry.path()),
                            name,
                            kind: MatchKind::Content,
                            size,
                        });
                    }
                }
            }
        }
        matches.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(matches)
    }

    fn dir(&self, path: &str) -> Result<PathBuf, ToolError> {
        let base = if path.trim().is_empty() || path.trim() == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        if !base.is_dir() {
            return Err(ToolError::InvalidArguments(format!("not a directory: {}", path)));
        }
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_in(dir: &Path) -> SafeFs {
        SafeFs::new(dir, 1024, &["exe".to_string(), ".sh".to_string()]).unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let fs = fs_in(dir.path());
        let written = fs.write_file("notes/a.txt", "hello").unwrap();
        assert!(written.created);
        assert_eq!(written.path, "notes/a.txt");
        let again = fs.write_file("notes/a.txt", "hello again").unwrap();
        assert!(!again.created);
        assert_eq!(fs.read_file("./notes/a.txt").unwrap().content, "hello again");
    }

    #[test]
    fn test_path_escape_denied() {
        let dir = tempfile::tempdir().unwrap();
        let fs = fs_in(dir.path());
        assert!(matches!(fs.read_file("../../etc/passwd"), Err(ToolError::AccessDenied(_))));
        assert!(matches!(fs.write_file("/tmp/x.txt", "x"), Err(ToolError::AccessDenied(_))));
        assert!(matches!(fs.read_file("missing.txt"), Err(ToolError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_denied() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "s").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let fs = fs_in(dir.path());
        assert!(matches!(fs.read_file("link/secret.txt"), Err(ToolError::AccessDenied(_))));
        assert!(matches!(fs.write_file("link/new.txt", "x"), Err(ToolError::AccessDenied(_))));
    }

    #[test]
    fn test_blocked_extension_and_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let fs = fs_in(dir.path());
        assert!(matches!(fs.write_file("run.SH", "echo"), Err(ToolError::AccessDenied(_))));
        assert!(matches!(
            fs.write_file("big.txt", &"x".repeat(2048)),
            Err(ToolError::InvalidArguments(_))
        ));
        std::fs::write(dir.path().join("big2.txt"), "y".repeat(4096)).unwrap();
        assert!(matches!(fs.read_file("big2.txt"), Err(ToolError::InvalidArguments(_))));
    }

    #[test]
    fn test_list_dirs_first_and_hidden_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let fs = fs_in(dir.path());
        fs.write_file("b.txt", "b").unwrap();
        fs.write_file("Zdir/inner.txt", "i").unwrap();
        std::fs::write(dir.path().join(".hidden"), "h").unwrap();

        let flat = fs.list_files(".", false, false).unwrap();
        let names: Vec<_> = flat.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Zdir", "b.txt"]);

        let deep = fs.list_files("", true, false).unwrap();
        assert!(deep.iter().any(|e| e.path == "Zdir/inner.txt"));
        let with_hidden = fs.list_files(".", false, true).unwrap();
        assert_eq!(with_hidden.len(), 3);
    }

    #[test]
    fn test_search_by_name_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let fs = fs_in(dir.path());
        fs.write_file("report.md", "quarterly numbers").unwrap();
        fs.write_file("src/lib.rs", "fn Quarterly() {}").unwrap();
        fs.write_file("other.txt", "nothing here").unwrap();

        let by_name = fs.search_files(".", "REPORT", false).unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].kind, MatchKind::Filename);

        let by_glob = fs.search_files(".", "*.rs", false).unwrap();
        assert_eq!(by_glob[0].path, "src/lib.rs");

        let by_content = fs.search_files(".", "quarterly", true).unwrap();
        let paths: Vec<_> = by_content.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["report.md", "src/lib.rs"]);
        assert!(by_content.iter().all(|m| m.kind == MatchKind::Content));
    }
}
