//! # DICOM 解析模块
//!
//! 负责候选文件的有效性判定（只读取文件头所需的字节范围）以及
//! 按固定字段映射提取患者、检查、序列元数据。

pub mod extractor;
#[cfg(any(test, feature = "fixture"))]
pub mod fixture;
pub mod schema;
pub mod validator;

pub use extractor::MetadataExtractor;
#[cfg(any(test, feature = "fixture"))]
pub use fixture::SyntheticInstance;
pub use schema::{FieldSpec, FieldType, HeaderReader};
pub use validator::{DicomHeader, DicomValidator, InvalidReason, ValidationResult};
