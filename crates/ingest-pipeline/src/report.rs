//! 运行报告

use dicom_ingest_core::{
    AttributeConflict, CommitReport, EntityCounts, ErrorKind, IngestError, IngestEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{error, warn};

/// 一次导入运行的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    /// 定位到的候选文件数
    pub discovered: usize,
    pub valid: usize,
    pub invalid: usize,
    pub unreadable: usize,
    pub metadata_incomplete: usize,
    pub collisions: usize,
    pub link_errors: usize,
    /// 新写入层级目录的文件数
    pub placed: usize,
    /// 目标已存在且内容相同的文件数
    pub already_present: usize,
    /// 同一序列中内容重复、不计入切片数的文件
    pub duplicate_files: usize,
    /// 各表新增的记录数
    pub inserted: EntityCounts,
    pub updated: EntityCounts,
    pub conflicts: Vec<AttributeConflict>,
    pub events: Vec<IngestEvent>,
    pub batches_committed: usize,
    /// 运行被取消，未处理的文件留待下次运行
    pub cancelled: bool,
}

impl IngestReport {
    /// 记录单个文件或记录的错误并计数
    pub fn record_error(&mut self, location: &str, err: &IngestError) {
        let kind = err.kind();
        match kind {
            ErrorKind::Unreadable => self.unreadable += 1,
            ErrorKind::Invalid => self.invalid += 1,
            ErrorKind::MetadataIncomplete => self.metadata_incomplete += 1,
            ErrorKind::HierarchyCollision => self.collisions += 1,
            ErrorKind::LinkError => self.link_errors += 1,
            ErrorKind::SourceUnavailable | ErrorKind::CommitFailure | ErrorKind::Internal => {}
        }

        match kind {
            ErrorKind::MetadataIncomplete | ErrorKind::CommitFailure | ErrorKind::Internal => {
                error!("{}: {}", location, err)
            }
            _ => warn!("{}: {}", location, err),
        }

        self.events.push(IngestEvent {
            kind,
            location: location.to_string(),
            message: err.to_string(),
        });
    }

    /// 合并一个批次的提交结果
    pub fn absorb_commit(&mut self, commit: CommitReport) {
        self.batches_committed += 1;
        self.inserted.add(&commit.inserted);
        self.updated.add(&commit.updated);
        self.conflicts.extend(commit.conflicts);
        for rejected in commit.rejected {
            self.link_errors += 1;
            self.events.push(IngestEvent {
                kind: ErrorKind::LinkError,
                location: format!("{} {}", rejected.entity, rejected.key),
                message: rejected.reason,
            });
        }
    }

    /// 按错误类型统计事件数
    pub fn counts_by_kind(&self) -> BTreeMap<ErrorKind, usize> {
        let mut counts = BTreeMap::new();
        for event in &self.events {
            *counts.entry(event.kind).or_insert(0) += 1;
        }
        counts
    }

    /// 本次运行新增的记录总数
    pub fn net_new_records(&self) -> usize {
        self.inserted.total()
    }
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Ingestion Report:")?;
        writeln!(f, "- Files discovered: {}", self.discovered)?;
        writeln!(f, "- Valid: {}", self.valid)?;
        writeln!(f, "- Invalid: {}", self.invalid)?;
        writeln!(f, "- Unreadable: {}", self.unreadable)?;
        writeln!(f, "- Metadata incomplete: {}", self.metadata_incomplete)?;
        writeln!(f, "- Hierarchy collisions: {}", self.collisions)?;
        writeln!(f, "- Link errors: {}", self.link_errors)?;
        writeln!(
            f,
            "- Files placed: {} (already present: {}, duplicates: {})",
            self.placed, self.already_present, self.duplicate_files
        )?;
        writeln!(
            f,
            "- New records: {} patients, {} studies, {} series",
            self.inserted.patients, self.inserted.studies, self.inserted.series
        )?;
        writeln!(f, "- Attribute conflicts: {}", self.conflicts.len())?;
        write!(f, "- Batches committed: {}", self.batches_committed)?;
        if self.cancelled {
            write!(f, "\n- Run cancelled before all files were processed")?;
        }
        Ok(())
    }
}
