//! 层级目录整理
//!
//! 目标路径为 `{root}/{PatientID}/{StudyInstanceUID}/{SeriesInstanceUID}/{文件名}`。
//! 写入先落到同目录下的临时文件，`sync_all` 后再 `rename`，崩溃时不会留下半写入的目标文件。
//! 同一目标路径上的放置操作互斥执行。
//! 移动模式下源文件不在放置时删除，由调用方在记录提交成功后调用 [`HierarchyOrganizer::release_source`]。

use dicom_ingest_core::config::OutputMode;
use dicom_ingest_core::utils::{content_hash, sanitize_path_component};
use dicom_ingest_core::{FileCandidate, IngestError, ObjectSource, Result, SourceKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 单个文件的放置请求
#[derive(Debug, Clone, Copy)]
pub struct PlacementRequest<'a> {
    pub candidate: &'a FileCandidate,
    /// 完整文件内容
    pub content: &'a [u8],
    /// `content` 的SHA-256（十六进制）
    pub content_hash: &'a str,
    pub patient_id: &'a str,
    pub study_uid: &'a str,
    pub series_uid: &'a str,
    pub sop_instance_uid: Option<&'a str>,
}

/// 放置结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// 新写入
    Placed(PathBuf),
    /// 目标已存在且内容相同
    AlreadyPresent(PathBuf),
}

impl Placement {
    pub fn path(&self) -> &Path {
        match self {
            Placement::Placed(path) | Placement::AlreadyPresent(path) => path,
        }
    }
}

/// 层级目录整理器
pub struct HierarchyOrganizer {
    root: PathBuf,
    mode: OutputMode,
    /// 目标路径 -> 互斥锁
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    remote_move_logged: AtomicBool,
}

impl HierarchyOrganizer {
    pub fn new(root: impl Into<PathBuf>, mode: OutputMode) -> Self {
        Self {
            root: root.into(),
            mode,
            locks: Mutex::new(HashMap::new()),
            remote_move_logged: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// 计算目标路径，不访问文件系统
    pub fn destination(&self, request: &PlacementRequest<'_>) -> PathBuf {
        self.root
            .join(sanitize_path_component(request.patient_id))
            .join(sanitize_path_component(request.study_uid))
            .join(sanitize_path_component(request.series_uid))
            .join(file_name_for(request))
    }

    /// 放置文件
    ///
    /// 目标已存在且内容哈希相同时不做任何写入；内容不同时返回 `HierarchyCollision`。
    pub async fn place(&self, request: PlacementRequest<'_>) -> Result<Placement> {
        let destination = self.destination(&request);
        let lock = self.lock_for(&destination).await;
        let placed = {
            let _guard = lock.lock().await;
            place_at(destination.clone(), &request).await
        };
        self.unlock(&destination, lock).await;
        placed
    }

    async fn lock_for(&self, destination: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(destination.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 没有其他等待者时移除目标路径的锁
    async fn unlock(&self, destination: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        let idle = locks
            .get(destination)
            .map_or(false, |held| Arc::strong_count(held) == 1);
        if idle {
            locks.remove(destination);
        }
    }

    /// 移动模式下删除已整理并提交的源文件
    ///
    /// 复制模式下不做任何操作；远程数据源的对象始终保留。
    pub async fn release_source(
        &self,
        source: &dyn ObjectSource,
        candidate: &FileCandidate,
        destination: &Path,
    ) -> Result<()> {
        if self.mode != OutputMode::Move {
            return Ok(());
        }
        if candidate.source_kind == SourceKind::Remote {
            if !self.remote_move_logged.swap(true, Ordering::Relaxed) {
                info!("Move mode on a remote source keeps the bucket objects; files are copied");
            }
            return Ok(());
        }
        // 源文件本身就是目标文件时（重新整理输出目录）不能删除
        if same_file(Path::new(&candidate.location), destination).await {
            return Ok(());
        }
        source.remove(&candidate.location).await
    }
}

async fn place_at(destination: PathBuf, request: &PlacementRequest<'_>) -> Result<Placement> {
    match tokio::fs::read(&destination).await {
        Ok(existing) => {
            if content_hash(&existing) != request.content_hash {
                warn!(
                    "Hierarchy collision: {} already holds different content than {}",
                    destination.display(),
                    request.candidate.location
                );
                return Err(IngestError::HierarchyCollision {
                    destination: destination.display().to_string(),
                });
            }
            debug!(
                "{} already present at {}",
                request.candidate.location,
                destination.display()
            );
            Ok(Placement::AlreadyPresent(destination))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            write_atomically(&destination, request.content).await?;
            debug!(
                "Placed {} -> {}",
                request.candidate.location,
                destination.display()
            );
            Ok(Placement::Placed(destination))
        }
        Err(e) => Err(e.into()),
    }
}

/// 源文件名优先；没有文件名时使用SOP实例UID或内容哈希前缀
fn file_name_for(request: &PlacementRequest<'_>) -> String {
    if let Some(name) = request.candidate.file_name() {
        return sanitize_path_component(name);
    }
    let stem = match request.sop_instance_uid {
        Some(uid) => sanitize_path_component(uid),
        None => request.content_hash.chars().take(16).collect(),
    };
    format!("{}.dcm", stem)
}

async fn write_atomically(destination: &Path, content: &[u8]) -> Result<()> {
    let parent = destination.parent().ok_or_else(|| {
        IngestError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", destination.display()),
        ))
    })?;
    tokio::fs::create_dir_all(parent).await?;

    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp = parent.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));

    let written = async {
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, destination).await
    }
    .await;

    if let Err(e) = written {
        if let Err(cleanup) = tokio::fs::remove_file(&temp).await {
            debug!("Could not remove temp file {}: {}", temp.display(), cleanup);
        }
        return Err(e.into());
    }
    Ok(())
}

async fn same_file(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::LocalSource;

    struct Fixture {
        _dir: tempfile::TempDir,
        input: PathBuf,
        output: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("organized");
        std::fs::create_dir_all(&input).unwrap();
        Fixture {
            _dir: dir,
            input,
            output,
        }
    }

    fn candidate_at(path: &Path, content: &[u8]) -> FileCandidate {
        std::fs::write(path, content).unwrap();
        FileCandidate {
            location: path.to_string_lossy().to_string(),
            size_bytes: content.len() as u64,
            source_kind: SourceKind::Local,
        }
    }

    fn request<'a>(
        candidate: &'a FileCandidate,
        content: &'a [u8],
        hash: &'a str,
    ) -> PlacementRequest<'a> {
        PlacementRequest {
            candidate,
            content,
            content_hash: hash,
            patient_id: "LIDC-IDRI-0001",
            study_uid: "1.3.6.1.1",
            series_uid: "1.3.6.1.1.2",
            sop_instance_uid: None,
        }
    }

    #[tokio::test]
    async fn test_place_copy_is_idempotent() {
        let fx = fixture();
        let content = b"slice one".to_vec();
        let hash = content_hash(&content);
        let candidate = candidate_at(&fx.input.join("1-001.dcm"), &content);
        let organizer = HierarchyOrganizer::new(&fx.output, OutputMode::Copy);

        let first = organizer
            .place(request(&candidate, &content, &hash))
            .await
            .unwrap();
        let expected = fx
            .output
            .join("LIDC-IDRI-0001")
            .join("1.3.6.1.1")
            .join("1.3.6.1.1.2")
            .join("1-001.dcm");
        assert_eq!(first, Placement::Placed(expected.clone()));
        assert_eq!(std::fs::read(&expected).unwrap(), content);

        let second = organizer
            .place(request(&candidate, &content, &hash))
            .await
            .unwrap();
        assert_eq!(second, Placement::AlreadyPresent(expected.clone()));

        // 没有遗留临时文件，源文件仍在
        let entries: Vec<_> = std::fs::read_dir(expected.parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(Path::new(&candidate.location).exists());
    }

    #[tokio::test]
    async fn test_different_content_is_collision() {
        let fx = fixture();
        std::fs::create_dir_all(fx.input.join("a")).unwrap();
        std::fs::create_dir_all(fx.input.join("b")).unwrap();
        let organizer = HierarchyOrganizer::new(&fx.output, OutputMode::Copy);

        let first_content = b"first".to_vec();
        let first_hash = content_hash(&first_content);
        let first = candidate_at(&fx.input.join("a").join("1-001.dcm"), &first_content);
        organizer
            .place(request(&first, &first_content, &first_hash))
            .await
            .unwrap();

        let other_content = b"second".to_vec();
        let other_hash = content_hash(&other_content);
        let other = candidate_at(&fx.input.join("b").join("1-001.dcm"), &other_content);
        let err = organizer
            .place(request(&other, &other_content, &other_hash))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::HierarchyCollision { .. }));

        let placed = organizer.destination(&request(&first, &first_content, &first_hash));
        assert_eq!(std::fs::read(placed).unwrap(), first_content);
    }

    #[tokio::test]
    async fn test_move_removes_local_source() {
        let fx = fixture();
        let content = b"moving slice".to_vec();
        let hash = content_hash(&content);
        let candidate = candidate_at(&fx.input.join("1-001.dcm"), &content);
        let source = LocalSource::new(&fx.input, vec![]);
        let organizer = HierarchyOrganizer::new(&fx.output, OutputMode::Move);

        let placement = organizer
            .place(request(&candidate, &content, &hash))
            .await
            .unwrap();
        assert!(placement.path().exists());
        // 放置本身不删除源文件
        assert!(Path::new(&candidate.location).exists());
        assert!(organizer.locks.lock().await.is_empty());

        organizer
            .release_source(&source, &candidate, placement.path())
            .await
            .unwrap();
        assert!(!Path::new(&candidate.location).exists());
    }

    #[tokio::test]
    async fn test_copy_mode_keeps_source_on_release() {
        let fx = fixture();
        let content = b"copied slice".to_vec();
        let hash = content_hash(&content);
        let candidate = candidate_at(&fx.input.join("1-001.dcm"), &content);
        let source = LocalSource::new(&fx.input, vec![]);
        let organizer = HierarchyOrganizer::new(&fx.output, OutputMode::Copy);

        let placement = organizer
            .place(request(&candidate, &content, &hash))
            .await
            .unwrap();
        organizer
            .release_source(&source, &candidate, placement.path())
            .await
            .unwrap();
        assert!(Path::new(&candidate.location).exists());
    }

    #[test]
    fn test_identifiers_are_sanitized() {
        let candidate = FileCandidate {
            location: "bucket/key/".to_string(),
            size_bytes: 1,
            source_kind: SourceKind::Remote,
        };
        let organizer = HierarchyOrganizer::new("/out", OutputMode::Copy);
        let request = PlacementRequest {
            candidate: &candidate,
            content: b"x",
            content_hash: "0123456789abcdef0123",
            patient_id: "../../etc",
            study_uid: "1.2.3",
            series_uid: "..",
            sop_instance_uid: Some("1.2.3.4"),
        };

        let destination = organizer.destination(&request);
        assert_eq!(
            destination,
            PathBuf::from("/out/.._.._etc/1.2.3/_/key")
        );

        let unnamed = FileCandidate {
            location: String::new(),
            ..candidate
        };
        let generated = organizer.destination(&PlacementRequest {
            candidate: &unnamed,
            sop_instance_uid: None,
            ..request
        });
        assert_eq!(generated.file_name().unwrap(), "0123456789abcdef.dcm");
    }
}
