//! 数据源抽象
//!
//! 流水线只依赖 `list` 和按字节范围 `fetch` 两种能力，本地目录和对象存储桶都通过
//! [`ObjectSource`] 接入。

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;

/// 数据源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    Local,
    Remote,
}

/// 待处理的候选文件，只包含位置和大小，不读取内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCandidate {
    /// 本地路径或对象键
    pub location: String,
    pub size_bytes: u64,
    pub source_kind: SourceKind,
}

impl FileCandidate {
    /// 原始文件名（路径最后一段）
    pub fn file_name(&self) -> Option<&str> {
        Path::new(&self.location)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
    }
}

/// 文件枚举与读取接口
#[async_trait]
pub trait ObjectSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// 数据源的可读描述，用于日志
    fn describe(&self) -> String;

    /// 枚举候选文件
    ///
    /// 每次调用都重新枚举；根目录或存储桶无法列出时返回 `SourceUnavailable`。
    async fn locate(&self) -> Result<BoxStream<'_, Result<FileCandidate>>>;

    /// 读取 `range` 范围内的字节，超出文件末尾的部分被截断
    async fn fetch(&self, location: &str, range: Range<u64>) -> Result<Bytes>;

    /// 删除源文件（移动模式下使用）
    async fn remove(&self, location: &str) -> Result<()>;
}

/// 扩展名过滤，列表为空时接受所有文件
pub fn matches_extension(location: &str, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    Path::new(location)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            extensions
                .iter()
                .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}
