//! # DICOM Ingest Storage
//!
//! 文件定位（本地目录、对象存储桶）和按 患者/检查/序列 层级整理输出目录。

pub mod hierarchy;
pub mod locator;

pub use hierarchy::{HierarchyOrganizer, Placement, PlacementRequest};
pub use locator::{open_source, BucketSource, LocalSource};
