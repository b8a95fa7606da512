//! 配置管理
//!
//! 依次叠加内置默认值、可选的TOML配置文件和 `DICOM_INGEST` 前缀的环境变量，
//! 例如 `DICOM_INGEST_PIPELINE__WORKERS=8`。

use crate::error::{IngestError, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// 导入流水线完整配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// 数据源配置
    pub source: SourceConfig,
    /// 输出目录配置
    pub output: OutputConfig,
    /// 数据库配置
    pub database: DatabaseConfig,
    /// 流水线配置
    pub pipeline: PipelineConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 数据源类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    Local,
    S3,
}

/// 数据源配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceType,
    /// 本地数据集根目录
    pub root: PathBuf,
    /// 存储桶名称
    pub bucket: Option<String>,
    /// 对象键前缀
    pub prefix: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    /// 远程列举/读取超时（秒）
    pub timeout_secs: u64,
    /// 接受的扩展名，为空时不过滤
    pub extensions: Vec<String>,
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceType::Local,
            root: PathBuf::from("lidc_small_dset"),
            bucket: None,
            prefix: None,
            region: None,
            endpoint: None,
            timeout_secs: 30,
            extensions: vec!["dcm".to_string()],
        }
    }
}

/// 文件放置方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Copy,
    Move,
}

/// 输出目录配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// 层级目录根
    pub root: PathBuf,
    pub mode: OutputMode,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("organized"),
            mode: OutputMode::Copy,
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 连接字符串
    pub url: String,
    /// 最大连接数
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://metadata.db".to_string(),
            max_connections: 4,
        }
    }
}

/// 流水线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 并发处理的文件数
    pub workers: usize,
    /// 每个提交批次包含的文件数
    pub batch_size: usize,
    /// 首次读取文件头的字节数
    pub header_probe_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 500,
            header_probe_bytes: 64 * 1024,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// 验证规则
struct ValidationRule {
    /// 字段路径
    field_path: &'static str,
    /// 验证函数
    validator: fn(&IngestConfig) -> bool,
    /// 错误消息
    error_message: &'static str,
}

const VALIDATION_RULES: &[ValidationRule] = &[
    ValidationRule {
        field_path: "pipeline.workers",
        validator: |config| config.pipeline.workers > 0,
        error_message: "workers must be at least 1",
    },
    ValidationRule {
        field_path: "pipeline.batch_size",
        validator: |config| config.pipeline.batch_size > 0,
        error_message: "batch size must be at least 1",
    },
    ValidationRule {
        field_path: "pipeline.header_probe_bytes",
        validator: |config| config.pipeline.header_probe_bytes >= 132,
        error_message: "probe must cover the 128-byte preamble and DICM magic",
    },
    ValidationRule {
        field_path: "source.bucket",
        validator: |config| {
            config.source.kind != SourceType::S3
                || config.source.bucket.as_deref().is_some_and(|b| !b.is_empty())
        },
        error_message: "an s3 source needs a bucket name",
    },
    ValidationRule {
        field_path: "output.root",
        validator: |config| !config.output.root.as_os_str().is_empty(),
        error_message: "output root cannot be empty",
    },
    ValidationRule {
        field_path: "database.max_connections",
        validator: |config| config.database.max_connections > 0,
        error_message: "database max connections cannot be 0",
    },
];

impl IngestConfig {
    /// 加载配置：默认值 < 配置文件 < 环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("DICOM_INGEST")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: IngestConfig = settings.try_deserialize()?;

        match config_path {
            Some(path) => info!("Configuration loaded from: {}", path),
            None => info!("Configuration loaded from defaults and environment"),
        }
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        for rule in VALIDATION_RULES {
            if !(rule.validator)(self) {
                error!("Configuration validation failed for {}", rule.field_path);
                return Err(IngestError::Config(format!(
                    "{}: {}",
                    rule.field_path, rule.error_message
                )));
            }
        }
        Ok(())
    }
}
