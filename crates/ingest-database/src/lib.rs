//! # DICOM Ingest Database
//!
//! 患者、检查、序列三张表的SQLite存储：批次提交（PersistenceSink）和只读汇总统计（SummaryReporter）。

pub mod connection;
pub mod models;
pub mod queries;
pub mod sink;
pub mod summary;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use models::*;
pub use queries::DatabaseQueries;
pub use sink::PersistenceSink;
pub use summary::{histogram, SummaryReporter, DEFAULT_HISTOGRAM_BINS};
