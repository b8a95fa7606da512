//! 导入引擎
//!
//! 读取类阶段（定位、验证、读取、提取）由有界并发的 `buffered` 流执行，结果按发现顺序交给
//! 单一消费者；归属检查、文件整理、关联和提交都在消费者中串行完成，合并顺序因此是确定的。
//! 移动模式下源文件在所属批次提交成功后才删除。

use crate::linker::RecordLinker;
use crate::report::IngestReport;
use bytes::Bytes;
use dicom_ingest_core::config::{OutputMode, PipelineConfig};
use dicom_ingest_core::utils::content_hash;
use dicom_ingest_core::{ExtractedRecord, FileCandidate, IngestError, ObjectSource, Result};
use dicom_ingest_database::{DatabasePool, DatabaseQueries, PersistenceSink};
use dicom_ingest_dicom::{DicomValidator, MetadataExtractor, ValidationResult};
use dicom_ingest_storage::{HierarchyOrganizer, Placement, PlacementRequest};
use futures::stream::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 读取阶段完成、等待整理和关联的文件
struct PreparedFile {
    candidate: FileCandidate,
    record: ExtractedRecord,
    content: Bytes,
    content_hash: String,
}

/// 单个候选文件在读取阶段的结果
enum FileOutcome {
    Prepared(Box<PreparedFile>),
    /// 单个文件的错误，记录后继续
    Skipped { location: String, error: IngestError },
    /// 数据源在枚举途中失效
    SourceLost(IngestError),
}

/// 已关联、待提交后删除的源文件
struct PendingRelease {
    candidate: FileCandidate,
    destination: PathBuf,
}

/// 导入流水线
pub struct IngestPipeline {
    source: Arc<dyn ObjectSource>,
    validator: DicomValidator,
    extractor: MetadataExtractor,
    organizer: HierarchyOrganizer,
    pool: DatabasePool,
    sink: PersistenceSink,
    settings: PipelineConfig,
}

impl IngestPipeline {
    pub fn new(
        source: Arc<dyn ObjectSource>,
        organizer: HierarchyOrganizer,
        pool: &DatabasePool,
        settings: PipelineConfig,
    ) -> Self {
        Self {
            source,
            validator: DicomValidator::new(settings.header_probe_bytes),
            extractor: MetadataExtractor::new(),
            organizer,
            pool: pool.clone(),
            sink: PersistenceSink::new(pool),
            settings,
        }
    }

    /// 执行一次完整导入
    ///
    /// 数据源不可用或批次提交失败时返回错误，此前已提交的批次保持有效。
    /// 取消后不再读取新文件，已在处理中的文件和未提交的记录仍会完成提交。
    pub async fn run(&self, cancel: CancellationToken) -> Result<IngestReport> {
        let known = DatabaseQueries::new(&self.pool).load_key_index().await?;
        let mut linker = RecordLinker::seeded(known);
        let mut report = IngestReport::default();

        info!(
            "Starting ingestion from {} into {} ({} workers, batch size {})",
            self.source.describe(),
            self.organizer.root().display(),
            self.settings.workers,
            self.settings.batch_size
        );

        let candidates = self.source.locate().await?;
        let mut outcomes = candidates
            .take_until(Box::pin(cancel.clone().cancelled_owned()))
            .map(|item| self.prepare(item))
            .buffered(self.settings.workers.max(1));

        let batch_size = self.settings.batch_size.max(1);
        let mut linked_since_commit = 0usize;
        let mut releases = Vec::new();
        let mut fatal = None;

        while let Some(outcome) = outcomes.next().await {
            let file = match outcome {
                FileOutcome::Prepared(file) => file,
                FileOutcome::Skipped { location, error } => {
                    report.discovered += 1;
                    report.record_error(&location, &error);
                    continue;
                }
                FileOutcome::SourceLost(err) => {
                    error!("Source became unavailable during enumeration: {}", err);
                    fatal = Some(err);
                    break;
                }
            };

            report.discovered += 1;
            report.valid += 1;
            match self.place_and_link(&mut linker, &mut report, *file).await {
                Ok(Some(release)) => {
                    linked_since_commit += 1;
                    if self.organizer.mode() == OutputMode::Move {
                        releases.push(release);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    fatal = Some(err);
                    break;
                }
            }

            if linked_since_commit >= batch_size {
                self.commit(&mut linker, &mut report, &mut releases).await?;
                linked_since_commit = 0;
            }
        }
        drop(outcomes);

        self.commit(&mut linker, &mut report, &mut releases).await?;
        if let Some(err) = fatal {
            return Err(err);
        }

        report.cancelled = cancel.is_cancelled();
        if report.cancelled {
            info!("Ingestion cancelled after {} files", report.discovered);
        }
        info!(
            "Ingestion finished: {} discovered, {} valid, {} invalid, {} new records",
            report.discovered,
            report.valid,
            report.invalid,
            report.net_new_records()
        );
        Ok(report)
    }

    /// 验证、读取并提取单个文件，不产生副作用
    async fn prepare(&self, item: Result<FileCandidate>) -> FileOutcome {
        let candidate = match item {
            Ok(candidate) => candidate,
            Err(err @ IngestError::SourceUnavailable(_)) => return FileOutcome::SourceLost(err),
            Err(err) => {
                let location = match &err {
                    IngestError::Unreadable { location, .. } => location.clone(),
                    _ => self.source.describe(),
                };
                return FileOutcome::Skipped {
                    location,
                    error: err,
                };
            }
        };
        let location = candidate.location.clone();
        let skipped = |error| FileOutcome::Skipped {
            location: location.clone(),
            error,
        };

        let header = match self.validator.validate(self.source.as_ref(), &candidate).await {
            ValidationResult::Valid(header) => header,
            ValidationResult::Invalid(reason) => {
                return skipped(IngestError::Invalid {
                    location: location.clone(),
                    reason: reason.to_string(),
                })
            }
            ValidationResult::Unreadable(reason) => {
                return skipped(IngestError::Unreadable {
                    location: location.clone(),
                    reason,
                })
            }
        };

        let record = match self.extractor.extract(&location, &header) {
            Ok(record) => record,
            Err(err) => return skipped(err),
        };

        let content = match self
            .source
            .fetch(&location, 0..candidate.size_bytes)
            .await
        {
            Ok(content) => content,
            Err(err) => return skipped(err),
        };
        let content_hash = content_hash(&content);

        FileOutcome::Prepared(Box::new(PreparedFile {
            candidate,
            record,
            content,
            content_hash,
        }))
    }

    /// 检查归属、放置文件并关联记录
    ///
    /// 返回 `Ok(Some(_))` 表示文件已关联；单个文件的错误记入报告后返回 `Ok(None)`，
    /// 只有会终止运行的错误才返回 `Err`。
    async fn place_and_link(
        &self,
        linker: &mut RecordLinker,
        report: &mut IngestReport,
        file: PreparedFile,
    ) -> Result<Option<PendingRelease>> {
        let location = file.candidate.location.as_str();

        if let Err(err) = linker.check(&file.record) {
            report.record_error(location, &IngestError::from(err));
            return Ok(None);
        }

        let request = PlacementRequest {
            candidate: &file.candidate,
            content: &file.content,
            content_hash: &file.content_hash,
            patient_id: &file.record.patient.patient_id,
            study_uid: &file.record.study.study_instance_uid,
            series_uid: &file.record.series.series_instance_uid,
            sop_instance_uid: file.record.sop_instance_uid.as_deref(),
        };
        let destination = match self.organizer.place(request).await {
            Ok(Placement::Placed(path)) => {
                report.placed += 1;
                path
            }
            Ok(Placement::AlreadyPresent(path)) => {
                report.already_present += 1;
                path
            }
            Err(err) if err.is_run_fatal() => {
                error!("Cannot place {}: {}", location, err);
                return Err(err);
            }
            Err(err) => {
                report.record_error(location, &err);
                return Ok(None);
            }
        };

        match linker.link(file.record, &file.content_hash) {
            Ok(outcome) => {
                if !outcome.counted {
                    report.duplicate_files += 1;
                }
                report.conflicts.extend(outcome.conflicts);
                debug!(
                    "Linked {} -> {}/{}/{}",
                    location, outcome.patient_id, outcome.study_uid, outcome.series_uid
                );
                Ok(Some(PendingRelease {
                    candidate: file.candidate,
                    destination,
                }))
            }
            Err(err) => {
                report.record_error(location, &IngestError::from(err));
                Ok(None)
            }
        }
    }

    /// 提交待写入的记录，成功后删除移动模式下的源文件
    ///
    /// 提交失败时源文件全部保留，重新运行可以再次处理它们。
    async fn commit(
        &self,
        linker: &mut RecordLinker,
        report: &mut IngestReport,
        releases: &mut Vec<PendingRelease>,
    ) -> Result<()> {
        let batch = linker.take_batch();
        if !batch.is_empty() {
            debug!("Committing batch of {} records", batch.len());
            let commit = self.sink.commit(&batch).await?;
            report.absorb_commit(commit);
        }

        for release in releases.drain(..) {
            if let Err(err) = self
                .organizer
                .release_source(self.source.as_ref(), &release.candidate, &release.destination)
                .await
            {
                report.record_error(&release.candidate.location, &err);
            }
        }
        Ok(())
    }
}
