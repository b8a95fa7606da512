//! # DICOM Ingest Pipeline
//!
//! 导入流水线的编排：
//! - 关联器：在内存中维护本次运行的 患者/检查/序列 实体图，检查主键归属并派生切片数
//! - 引擎：定位 -> 验证 -> 提取 -> 整理 -> 关联 -> 分批提交
//! - 运行报告：按错误类型计数，以及每张表新增的记录数

pub mod engine;
pub mod linker;
pub mod report;

// 重新导出主要类型
pub use engine::IngestPipeline;
pub use linker::{LinkOutcome, RecordLinker};
pub use report::IngestReport;
