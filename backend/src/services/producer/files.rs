//! File-tree archive producer.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tar::{Archive, Builder};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::{discard, ArchiveProducer, ProduceContext, ProducedArchive, RestoreTarget};
use crate::error::{AppError, Result};
use crate::models::SourceKind;

#[derive(Debug)]
struct GlobRule {
    regex: Regex,
    /// Patterns without a `/` match the file name at any depth.
    basename_only: bool,
}

impl GlobRule {
    fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&glob_to_regex(pattern))
            .map_err(|e| AppError::Validation(format!("Invalid pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            regex,
            basename_only: !pattern.contains('/'),
        })
    }

    fn matches(&self, relative: &str) -> bool {
        if self.basename_only {
            let name = relative.rsplit('/').next().unwrap_or(relative);
            self.regex.is_match(name)
        } else {
            self.regex.is_match(relative)
        }
    }
}

/// Translate `*`, `**` and `?` into an anchored regex.
fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut re = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    re.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    re.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    re.push('$');
    re
}

/// Include / exclude filter over `/`-separated paths relative to a root.
#[derive(Debug, Default)]
pub struct PathFilter {
    include: Vec<GlobRule>,
    exclude: Vec<GlobRule>,
}

impl PathFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: include.iter().map(|p| GlobRule::new(p)).collect::<Result<_>>()?,
            exclude: exclude.iter().map(|p| GlobRule::new(p)).collect::<Result<_>>()?,
        })
    }

    /// An empty include list admits everything; excludes always win.
    pub fn admits(&self, relative: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|r| r.matches(relative));
        included && !self.is_excluded(relative)
    }

    pub fn is_excluded(&self, relative: &str) -> bool {
        self.exclude.iter().any(|r| r.matches(relative))
    }
}

/// Archives the configured roots into one tarball.
///
/// Entries are stored as `{label}/{relative path}` where the label is the
/// root's directory name, suffixed when two roots share one.
pub struct FileProducer {
    roots: Vec<(String, PathBuf)>,
    filter: Arc<PathFilter>,
}

impl FileProducer {
    pub fn new(roots: Vec<PathBuf>, filter: PathFilter) -> Self {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let roots = roots
            .into_iter()
            .map(|root| {
                let base = root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "root".to_string());
                let count = seen.entry(base.clone()).or_insert(0);
                *count += 1;
                let label = if *count == 1 {
                    base
                } else {
                    format!("{}-{}", base, count)
                };
                (label, root)
            })
            .collect();

        Self {
            roots,
            filter: Arc::new(filter),
        }
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn append_tree<W: Write>(
    builder: &mut Builder<W>,
    roots: &[(String, PathBuf)],
    filter: &PathFilter,
    cancel: &CancellationToken,
) -> Result<(Vec<String>, u64)> {
    let mut sources = Vec::new();
    let mut total = 0u64;

    for (label, root) in roots {
        if !root.is_dir() {
            return Err(AppError::BackupFailed(format!(
                "File root {} does not exist",
                root.display()
            )));
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || relative_key(root, entry.path()).map_or(true, |rel| !filter.is_excluded(&rel))
            });

        for entry in walker {
            if cancel.is_cancelled() {
                return Err(AppError::BackupFailed("Backup cancelled".into()));
            }
            let entry = entry.map_err(|e| AppError::BackupFailed(format!("Walk failed: {}", e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = relative_key(root, entry.path()) else {
                continue;
            };
            if !filter.admits(&rel) {
                continue;
            }

            let name = format!("{}/{}", label, rel);
            let size = entry
                .metadata()
                .map_err(|e| AppError::BackupFailed(format!("{}: {}", name, e)))?
                .len();
            builder
                .append_path_with_name(entry.path(), &name)
                .map_err(|e| AppError::BackupFailed(format!("Failed to archive {}: {}", name, e)))?;
            total += size;
            sources.push(name);
        }
    }

    Ok((sources, total))
}

fn build_archive(
    roots: &[(String, PathBuf)],
    filter: &PathFilter,
    dest: &Path,
    compress: bool,
    cancel: &CancellationToken,
) -> Result<(Vec<String>, u64)> {
    let file = File::create(dest)?;
    let archive_err = |e: std::io::Error| AppError::BackupFailed(format!("Archive write failed: {}", e));

    if compress {
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        let out = append_tree(&mut builder, roots, filter, cancel)?;
        builder
            .into_inner()
            .and_then(|gz| gz.finish())
            .and_then(|f| f.sync_all())
            .map_err(archive_err)?;
        Ok(out)
    } else {
        let mut builder = Builder::new(file);
        let out = append_tree(&mut builder, roots, filter, cancel)?;
        builder
            .into_inner()
            .and_then(|f| f.sync_all())
            .map_err(archive_err)?;
        Ok(out)
    }
}

fn safe_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

fn unpack_archive(
    archive: &Path,
    compressed: bool,
    roots: &[(String, PathBuf)],
    target: &RestoreTarget,
) -> Result<usize> {
    let file = File::open(archive)?;
    let reader: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut tar = Archive::new(reader);
    let mut restored = 0usize;

    match target {
        RestoreTarget::Directory(dir) => {
            std::fs::create_dir_all(dir)?;
            for entry in tar.entries()? {
                let mut entry = entry?;
                if entry.unpack_in(dir)? {
                    restored += 1;
                }
            }
        }
        RestoreTarget::Live => {
            let by_label: HashMap<&str, &Path> = roots
                .iter()
                .map(|(label, root)| (label.as_str(), root.as_path()))
                .collect();

            for entry in tar.entries()? {
                let mut entry = entry?;
                let path = entry.path()?.into_owned();
                let Some(rel) = safe_relative(&path) else {
                    return Err(AppError::Validation(format!(
                        "Refusing unsafe archive path {}",
                        path.display()
                    )));
                };
                let mut parts = rel.components();
                let label = parts
                    .next()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .unwrap_or_default();
                let Some(root) = by_label.get(label.as_str()) else {
                    tracing::warn!(entry = %path.display(), "Archive entry has no matching root, skipped");
                    continue;
                };
                let dest = root.join(parts.as_path());
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry.unpack(&dest)?;
                restored += 1;
            }
        }
        RestoreTarget::Database(_) => {
            return Err(AppError::Validation(
                "File archives cannot be restored into a database".into(),
            ))
        }
    }

    Ok(restored)
}

#[async_trait]
impl ArchiveProducer for FileProducer {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Files
    }

    async fn produce(&self, ctx: &ProduceContext<'_>) -> Result<ProducedArchive> {
        let extension = if ctx.compress { "tar.gz" } else { "tar" };
        let dest = ctx.work_dir.join(format!("{}.{}", ctx.artifact_id, extension));

        let roots = self.roots.clone();
        let filter = self.filter.clone();
        let cancel = ctx.cancel.clone();
        let compress = ctx.compress;
        let path = dest.clone();

        let result = tokio::task::spawn_blocking(move || {
            build_archive(&roots, &filter, &path, compress, &cancel)
        })
        .await
        .map_err(|e| AppError::BackupFailed(format!("Archive task failed: {}", e)))
        .and_then(|r| r);

        match result {
            Ok((sources, size_bytes)) => {
                tracing::debug!(
                    artifact_id = %ctx.artifact_id,
                    files = sources.len(),
                    size_bytes,
                    "File archive written"
                );
                Ok(ProducedArchive {
                    path: dest,
                    extension,
                    sources,
                    size_bytes,
                    compressed: ctx.compress,
                })
            }
            Err(e) => {
                discard(&dest).await;
                Err(match e {
                    AppError::BackupFailed(_) => e,
                    other => AppError::BackupFailed(other.to_string()),
                })
            }
        }
    }

    async fn restore(
        &self,
        archive: &Path,
        compressed: bool,
        target: &RestoreTarget,
    ) -> Result<()> {
        let archive = archive.to_path_buf();
        let roots = self.roots.clone();
        let target = target.clone();

        let restored = tokio::task::spawn_blocking(move || {
            unpack_archive(&archive, compressed, &roots, &target)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Restore task failed: {}", e)))??;

        tracing::info!(files = restored, "File archive restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn test_glob_translation() {
        let filter = PathFilter::new(
            &["docs/**".into(), "*.txt".into()],
            &["**/tmp/**".into(), "*.log".into()],
        )
        .unwrap();

        assert!(filter.admits("docs/a/b.md"));
        assert!(filter.admits("notes.txt"));
        assert!(filter.admits("deep/nested/readme.txt"));
        assert!(!filter.admits("src/main.rs"));
        assert!(!filter.admits("docs/tmp/scratch.md"));
        assert!(!filter.admits("docs/debug.log"));
    }

    #[test]
    fn test_question_mark_matches_one_char() {
        let filter = PathFilter::new(&["file?.csv".into()], &[]).unwrap();
        assert!(filter.admits("file1.csv"));
        assert!(!filter.admits("file10.csv"));
    }

    #[test]
    fn test_duplicate_root_names_get_suffix() {
        let producer = FileProducer::new(
            vec!["/a/uploads".into(), "/b/uploads".into()],
            PathFilter::default(),
        );
        let labels: Vec<_> = producer.roots.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["uploads", "uploads-2"]);
    }

    #[tokio::test]
    async fn test_archive_and_restore_live() {
        let src = TempDir::new().unwrap();
        let root = src.path().join("uploads");
        write(&root, "a.txt", "alpha");
        write(&root, "nested/b.txt", "bravo");
        write(&root, "cache/c.bin", "skip me");

        let producer = FileProducer::new(
            vec![root.clone()],
            PathFilter::new(&[], &["cache".into()]).unwrap(),
        );
        let work = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let ctx = ProduceContext {
            artifact_id: Uuid::new_v4(),
            work_dir: work.path(),
            compress: true,
            cancel: &cancel,
        };

        let archive = producer.produce(&ctx).await.unwrap();
        assert_eq!(archive.extension, "tar.gz");
        assert_eq!(archive.sources, vec!["uploads/a.txt", "uploads/nested/b.txt"]);
        assert_eq!(archive.size_bytes, 10);

        std::fs::remove_dir_all(&root).unwrap();
        producer
            .restore(&archive.path, true, &RestoreTarget::Live)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "alpha");
        assert_eq!(
            std::fs::read_to_string(root.join("nested/b.txt")).unwrap(),
            "bravo"
        );
        assert!(!root.join("cache").exists());
    }

    #[tokio::test]
    async fn test_restore_into_directory() {
        let src = TempDir::new().unwrap();
        let root = src.path().join("data");
        write(&root, "x.csv", "1,2,3");

        let producer = FileProducer::new(vec![root], PathFilter::default());
        let work = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let ctx = ProduceContext {
            artifact_id: Uuid::new_v4(),
            work_dir: work.path(),
            compress: false,
            cancel: &cancel,
        };
        let archive = producer.produce(&ctx).await.unwrap();

        let out = TempDir::new().unwrap();
        producer
            .restore(
                &archive.path,
                false,
                &RestoreTarget::Directory(out.path().to_path_buf()),
            )
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(out.path().join("data/x.csv")).unwrap(),
            "1,2,3"
        );
    }

    #[tokio::test]
    async fn test_missing_root_fails_without_leftovers() {
        let work = TempDir::new().unwrap();
        let producer = FileProducer::new(vec!["/definitely/not/here".into()], PathFilter::default());
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();
        let ctx = ProduceContext {
            artifact_id: id,
            work_dir: work.path(),
            compress: false,
            cancel: &cancel,
        };

        let err = producer.produce(&ctx).await.unwrap_err();
        assert!(matches!(err, AppError::BackupFailed(_)));
        assert!(!work.path().join(format!("{}.tar", id)).exists());
    }

    #[tokio::test]
    async fn test_cancelled_run_fails() {
        let src = TempDir::new().unwrap();
        write(src.path(), "a.txt", "a");
        let producer = FileProducer::new(vec![src.path().to_path_buf()], PathFilter::default());
        let work = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = ProduceContext {
            artifact_id: Uuid::new_v4(),
            work_dir: work.path(),
            compress: false,
            cancel: &cancel,
        };
        assert!(producer.produce(&ctx).await.is_err());
    }
}
