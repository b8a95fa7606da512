//! 文件定位
//!
//! 本地目录通过 `walkdir` 在阻塞线程中遍历，结果经有界通道逐个交给流水线；
//! 对象存储桶通过 `object_store` 分页列举，列举和读取都带超时。

use async_trait::async_trait;
use bytes::Bytes;
use dicom_ingest_core::config::{SourceConfig, SourceType};
use dicom_ingest_core::source::matches_extension;
use dicom_ingest_core::{FileCandidate, IngestError, ObjectSource, Result, SourceKind};
use futures::stream::{self, BoxStream, StreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use std::future::Future;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// 遍历线程与流水线之间的缓冲条目数
const WALK_CHANNEL_CAPACITY: usize = 256;

/// 本地目录数据源
#[derive(Debug, Clone)]
pub struct LocalSource {
    root: PathBuf,
    extensions: Vec<String>,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            root: root.into(),
            extensions,
        }
    }
}

#[async_trait]
impl ObjectSource for LocalSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn locate(&self) -> Result<BoxStream<'_, Result<FileCandidate>>> {
        let metadata = tokio::fs::metadata(&self.root).await.map_err(|e| {
            IngestError::SourceUnavailable(format!("{}: {}", self.root.display(), e))
        })?;
        if !metadata.is_dir() {
            return Err(IngestError::SourceUnavailable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }

        info!("Scanning local directory: {}", self.root.display());
        let (tx, rx) = mpsc::channel(WALK_CHANNEL_CAPACITY);
        let root = self.root.clone();
        let extensions = self.extensions.clone();
        tokio::task::spawn_blocking(move || walk_directory(&root, &extensions, &tx));

        let candidates = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(candidates.boxed())
    }

    async fn fetch(&self, location: &str, range: Range<u64>) -> Result<Bytes> {
        let unreadable = |e: std::io::Error| IngestError::Unreadable {
            location: location.to_string(),
            reason: e.to_string(),
        };

        let mut file = tokio::fs::File::open(location).await.map_err(unreadable)?;
        file.seek(SeekFrom::Start(range.start))
            .await
            .map_err(unreadable)?;

        let wanted = range.end.saturating_sub(range.start);
        let mut buffer = Vec::with_capacity(wanted.min(1 << 20) as usize);
        file.take(wanted)
            .read_to_end(&mut buffer)
            .await
            .map_err(unreadable)?;
        Ok(Bytes::from(buffer))
    }

    async fn remove(&self, location: &str) -> Result<()> {
        tokio::fs::remove_file(location).await?;
        debug!("Removed source file: {}", location);
        Ok(())
    }
}

/// 在阻塞线程中遍历目录；接收端关闭时提前结束
fn walk_directory(root: &Path, extensions: &[String], tx: &mpsc::Sender<Result<FileCandidate>>) {
    let mut matched = 0usize;
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // 无法进入的子目录不影响其余部分
                warn!("Error accessing entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let location = entry.path().to_string_lossy().to_string();
        if !matches_extension(&location, extensions) {
            trace!("Skipping {} (extension filter)", location);
            continue;
        }

        let item = match entry.metadata() {
            Ok(metadata) => Ok(FileCandidate {
                location,
                size_bytes: metadata.len(),
                source_kind: SourceKind::Local,
            }),
            Err(e) => Err(IngestError::Unreadable {
                location,
                reason: e.to_string(),
            }),
        };
        matched += 1;
        if tx.blocking_send(item).is_err() {
            debug!("Candidate receiver closed, stopping directory walk");
            return;
        }
    }
    debug!("Directory walk complete: {} candidates under {}", matched, root.display());
}

/// 对象存储桶数据源
#[derive(Debug, Clone)]
pub struct BucketSource {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: Option<ObjectPath>,
    timeout: Duration,
    extensions: Vec<String>,
}

impl BucketSource {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: Option<&str>,
        timeout: Duration,
        extensions: Vec<String>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix
                .map(|p| p.trim_matches('/'))
                .filter(|p| !p.is_empty())
                .map(ObjectPath::from),
            timeout,
            extensions,
        }
    }

    fn candidate(&self, meta: ObjectMeta) -> Option<FileCandidate> {
        let location = meta.location.to_string();
        if !matches_extension(&location, &self.extensions) {
            trace!("Skipping {} (extension filter)", location);
            return None;
        }
        Some(FileCandidate {
            location,
            size_bytes: meta.size as u64,
            source_kind: SourceKind::Remote,
        })
    }

    async fn bounded<T, F>(&self, location: &str, operation: F) -> Result<T>
    where
        F: Future<Output = object_store::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(IngestError::Unreadable {
                location: location.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(IngestError::Unreadable {
                location: location.to_string(),
                reason: format!("timed out after {:?}", self.timeout),
            }),
        }
    }
}

#[async_trait]
impl ObjectSource for BucketSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    fn describe(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("s3://{}/{}", self.bucket, prefix),
            None => format!("s3://{}", self.bucket),
        }
    }

    async fn locate(&self) -> Result<BoxStream<'_, Result<FileCandidate>>> {
        let limit = self.timeout;
        let mut listing = self.store.list(self.prefix.as_ref());

        // 首个条目决定存储桶是否可用
        let first = match tokio::time::timeout(limit, listing.next()).await {
            Err(_) => {
                return Err(IngestError::SourceUnavailable(format!(
                    "listing {} timed out after {:?}",
                    self.describe(),
                    limit
                )))
            }
            Ok(Some(Err(e))) => {
                return Err(IngestError::SourceUnavailable(format!(
                    "{}: {}",
                    self.describe(),
                    e
                )))
            }
            Ok(first) => first,
        };
        info!("Listing bucket: {}", self.describe());

        let described = self.describe();
        let rest = stream::unfold(Some(listing), move |state| {
            let described = described.clone();
            async move {
                let mut listing = state?;
                match tokio::time::timeout(limit, listing.next()).await {
                    Ok(Some(item)) => Some((item, Some(listing))),
                    Ok(None) => None,
                    Err(_) => {
                        let err = object_store::Error::Generic {
                            store: "bucket",
                            source: format!("listing {} timed out after {:?}", described, limit)
                                .into(),
                        };
                        Some((Err(err), None))
                    }
                }
            }
        });

        let candidates = stream::iter(first).chain(rest).filter_map(move |item| {
            let candidate = match item {
                Ok(meta) => self.candidate(meta).map(Ok),
                Err(e) => Some(Err(IngestError::SourceUnavailable(format!(
                    "{}: {}",
                    self.describe(),
                    e
                )))),
            };
            futures::future::ready(candidate)
        });
        Ok(candidates.boxed())
    }

    async fn fetch(&self, location: &str, range: Range<u64>) -> Result<Bytes> {
        let path = ObjectPath::from(location);
        let wanted = range.start as usize..range.end as usize;
        if wanted.is_empty() {
            return Ok(Bytes::new());
        }

        match self
            .bounded(location, self.store.get_range(&path, wanted.clone()))
            .await
        {
            Ok(bytes) => Ok(bytes),
            Err(first_error) => {
                // 请求范围超出对象末尾时按实际大小截断后重试
                let meta = self.bounded(location, self.store.head(&path)).await?;
                if wanted.end <= meta.size {
                    return Err(first_error);
                }
                let clamped = wanted.start.min(meta.size)..meta.size;
                if clamped.is_empty() {
                    return Ok(Bytes::new());
                }
                self.bounded(location, self.store.get_range(&path, clamped))
                    .await
            }
        }
    }

    async fn remove(&self, location: &str) -> Result<()> {
        let path = ObjectPath::from(location);
        self.bounded(location, self.store.delete(&path)).await?;
        debug!("Removed object: {}", location);
        Ok(())
    }
}

/// 按配置创建数据源
pub fn open_source(config: &SourceConfig) -> Result<Arc<dyn ObjectSource>> {
    match config.kind {
        SourceType::Local => Ok(Arc::new(LocalSource::new(
            config.root.clone(),
            config.extensions.clone(),
        ))),
        SourceType::S3 => {
            let bucket = config
                .bucket
                .as_deref()
                .filter(|b| !b.is_empty())
                .ok_or_else(|| IngestError::Config("an s3 source needs a bucket name".to_string()))?;

            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
            if let Some(region) = &config.region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &config.endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            let store = builder
                .build()
                .map_err(|e| IngestError::Config(format!("s3 source: {}", e)))?;

            Ok(Arc::new(BucketSource::new(
                Arc::new(store),
                bucket,
                config.prefix.as_deref(),
                config.timeout(),
                config.extensions.clone(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::throttle::{ThrottleConfig, ThrottledStore};

    fn dcm() -> Vec<String> {
        vec!["dcm".to_string()]
    }

    async fn collect(source: &dyn ObjectSource) -> Vec<FileCandidate> {
        let mut stream = source.locate().await.unwrap();
        let mut found = Vec::new();
        while let Some(item) = stream.next().await {
            found.push(item.unwrap());
        }
        found
    }

    #[tokio::test]
    async fn test_local_source_walks_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("LIDC-IDRI-0001").join("series");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("1-001.dcm"), b"first").unwrap();
        std::fs::write(nested.join("1-002.DCM"), b"second!").unwrap();
        std::fs::write(nested.join("notes.txt"), b"skip me").unwrap();
        std::fs::write(dir.path().join("top.dcm"), b"x").unwrap();

        let source = LocalSource::new(dir.path(), dcm());
        let found = collect(&source).await;

        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|c| c.source_kind == SourceKind::Local));
        let second = found
            .iter()
            .find(|c| c.location.ends_with("1-002.DCM"))
            .unwrap();
        assert_eq!(second.size_bytes, 7);
    }

    #[tokio::test]
    async fn test_local_source_missing_root_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = LocalSource::new(dir.path().join("absent"), dcm());
        assert!(matches!(
            source.locate().await,
            Err(IngestError::SourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_local_fetch_range_is_truncated_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dcm");
        std::fs::write(&path, b"0123456789").unwrap();
        let source = LocalSource::new(dir.path(), dcm());
        let location = path.to_string_lossy().to_string();

        assert_eq!(&source.fetch(&location, 2..5).await.unwrap()[..], b"234");
        assert_eq!(&source.fetch(&location, 8..64).await.unwrap()[..], b"89");
        assert!(matches!(
            source.fetch("/definitely/not/here.dcm", 0..4).await,
            Err(IngestError::Unreadable { .. })
        ));
    }

    async fn bucket_with(objects: &[(&str, &str)]) -> BucketSource {
        let store = Arc::new(InMemory::new());
        for (key, data) in objects {
            store
                .put(&ObjectPath::from(*key), Bytes::from(data.to_string()))
                .await
                .unwrap();
        }
        BucketSource::new(store, "test-bucket", Some("lidc/"), Duration::from_secs(5), dcm())
    }

    #[tokio::test]
    async fn test_bucket_source_lists_prefix_and_filters() {
        let source = bucket_with(&[
            ("lidc/P1/1-001.dcm", "abc"),
            ("lidc/P1/readme.md", "text"),
            ("other/P2/1-001.dcm", "abc"),
        ])
        .await;

        let found = collect(&source).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].location, "lidc/P1/1-001.dcm");
        assert_eq!(found[0].size_bytes, 3);
        assert_eq!(found[0].source_kind, SourceKind::Remote);
        assert_eq!(source.describe(), "s3://test-bucket/lidc");
    }

    #[tokio::test]
    async fn test_bucket_fetch_clamps_range() {
        let source = bucket_with(&[("lidc/a.dcm", "0123456789")]).await;
        assert_eq!(&source.fetch("lidc/a.dcm", 0..4).await.unwrap()[..], b"0123");
        assert_eq!(&source.fetch("lidc/a.dcm", 6..100).await.unwrap()[..], b"6789");
        assert!(matches!(
            source.fetch("lidc/missing.dcm", 0..4).await,
            Err(IngestError::Unreadable { .. })
        ));
    }

    async fn slow_bucket(config: ThrottleConfig) -> BucketSource {
        let inner = InMemory::new();
        inner
            .put(&ObjectPath::from("lidc/a.dcm"), Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        BucketSource::new(
            Arc::new(ThrottledStore::new(inner, config)),
            "slow-bucket",
            Some("lidc"),
            Duration::from_millis(50),
            dcm(),
        )
    }

    #[tokio::test]
    async fn test_slow_listing_is_unavailable() {
        let source = slow_bucket(ThrottleConfig {
            wait_list_per_call: Duration::from_secs(2),
            ..ThrottleConfig::default()
        })
        .await;
        assert!(matches!(
            source.locate().await,
            Err(IngestError::SourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_fetch_is_unreadable() {
        let source = slow_bucket(ThrottleConfig {
            wait_get_per_call: Duration::from_secs(2),
            ..ThrottleConfig::default()
        })
        .await;

        // 列举不受影响
        assert_eq!(collect(&source).await.len(), 1);
        match source.fetch("lidc/a.dcm", 0..4).await {
            Err(IngestError::Unreadable { location, reason }) => {
                assert_eq!(location, "lidc/a.dcm");
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected Unreadable, got {:?}", other),
        }
    }

    #[test]
    fn test_open_source_requires_bucket() {
        let config = SourceConfig {
            kind: SourceType::S3,
            ..SourceConfig::default()
        };
        assert!(matches!(open_source(&config), Err(IngestError::Config(_))));

        let local = open_source(&SourceConfig::default()).unwrap();
        assert_eq!(local.kind(), SourceKind::Local);
    }
}
