//! # DICOM Ingest Core
//!
//! 影像导入流水线的核心模块，提供实体模型、错误分类、配置以及通用工具。

pub mod config;
pub mod error;
pub mod models;
pub mod source;
pub mod utils;

pub use config::IngestConfig;
pub use error::{EntityKind, ErrorKind, IngestError, LinkError, Result};
pub use models::*;
pub use source::{FileCandidate, ObjectSource, SourceKind};
