//! 错误定义模块

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 导入流水线统一错误类型
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("数据源不可用: {0}")]
    SourceUnavailable(String),

    #[error("文件不可读: {location}: {reason}")]
    Unreadable { location: String, reason: String },

    #[error("无效的DICOM文件: {location}: {reason}")]
    Invalid { location: String, reason: String },

    #[error("元数据不完整: {location}: 缺少 {field}")]
    MetadataIncomplete { location: String, field: &'static str },

    #[error("目录层级冲突: {destination} 已存在不同内容的文件")]
    HierarchyCollision { destination: String },

    #[error("关联错误: {0}")]
    Link(#[from] LinkError),

    #[error("批次提交失败: {0}")]
    CommitFailure(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IngestError {
    /// 错误所属的分类，用于运行报告计数
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            IngestError::Unreadable { .. } => ErrorKind::Unreadable,
            IngestError::Invalid { .. } => ErrorKind::Invalid,
            IngestError::MetadataIncomplete { .. } => ErrorKind::MetadataIncomplete,
            IngestError::HierarchyCollision { .. } => ErrorKind::HierarchyCollision,
            IngestError::Link(_) => ErrorKind::LinkError,
            IngestError::CommitFailure(_) | IngestError::Database(_) => ErrorKind::CommitFailure,
            IngestError::Config(_) | IngestError::Io(_) | IngestError::Serialization(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// 是否会终止整个运行（而不是只跳过单个文件或记录）
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SourceUnavailable | ErrorKind::CommitFailure | ErrorKind::Internal
        )
    }
}

impl From<config::ConfigError> for IngestError {
    fn from(err: config::ConfigError) -> Self {
        IngestError::Config(err.to_string())
    }
}

/// 实体关联错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("检查 {study_uid} 已属于患者 {existing_patient}，不能再归属患者 {claimed_patient}")]
    CrossPatientStudy {
        study_uid: String,
        existing_patient: String,
        claimed_patient: String,
    },

    #[error("序列 {series_uid} 已属于检查 {existing_study}，不能再归属检查 {claimed_study}")]
    CrossStudySeries {
        series_uid: String,
        existing_study: String,
        claimed_study: String,
    },

    #[error("{entity} {key} 引用的上级记录 {parent} 不存在")]
    MissingParent {
        entity: EntityKind,
        key: String,
        parent: String,
    },
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    SourceUnavailable,
    Unreadable,
    Invalid,
    MetadataIncomplete,
    HierarchyCollision,
    LinkError,
    CommitFailure,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::SourceUnavailable => "SourceUnavailable",
            ErrorKind::Unreadable => "Unreadable",
            ErrorKind::Invalid => "Invalid",
            ErrorKind::MetadataIncomplete => "MetadataIncomplete",
            ErrorKind::HierarchyCollision => "HierarchyCollision",
            ErrorKind::LinkError => "LinkError",
            ErrorKind::CommitFailure => "CommitFailure",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// 实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Patient,
    Study,
    Series,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Patient => write!(f, "Patient"),
            EntityKind::Study => write!(f, "Study"),
            EntityKind::Series => write!(f, "Series"),
        }
    }
}

/// 导入流水线统一结果类型
pub type Result<T> = std::result::Result<T, IngestError>;
