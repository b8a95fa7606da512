//! DICOM导入命令行程序

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dicom_ingest_core::config::{OutputMode, SourceType};
use dicom_ingest_core::{HistogramBin, IngestConfig, Statistics};
use dicom_ingest_database::{
    DatabasePool, DatabaseQueries, SummaryReporter, DEFAULT_HISTOGRAM_BINS,
};
use dicom_ingest_pipeline::{IngestPipeline, IngestReport};
use dicom_ingest_storage::{open_source, HierarchyOrganizer};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};

/// 文件放置方式
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Copy,
    Move,
}

impl From<ModeArg> for OutputMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Copy => OutputMode::Copy,
            ModeArg::Move => OutputMode::Move,
        }
    }
}

/// 命令行参数，未指定的项使用配置文件或环境变量中的值
#[derive(Parser, Debug)]
#[command(name = "dicom-ingest")]
#[command(about = "将DICOM数据集整理为 患者/检查/序列 目录层级并写入元数据库")]
struct Args {
    /// 配置文件路径 (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// 本地数据集根目录
    #[arg(short, long, conflicts_with = "bucket")]
    input: Option<PathBuf>,

    /// S3存储桶名称
    #[arg(long)]
    bucket: Option<String>,

    /// 存储桶中的对象键前缀
    #[arg(long, requires = "bucket")]
    prefix: Option<String>,

    /// 层级目录根
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 数据库连接字符串，例如 sqlite://metadata.db
    #[arg(short, long)]
    database: Option<String>,

    /// 复制或移动源文件
    #[arg(short, long, value_enum)]
    mode: Option<ModeArg>,

    /// 并发处理的文件数
    #[arg(short, long)]
    workers: Option<usize>,

    /// 每个提交批次包含的文件数
    #[arg(long)]
    batch_size: Option<usize>,

    /// 日志级别
    #[arg(short, long)]
    log_level: Option<String>,

    /// 将汇总统计和切片厚度直方图写入JSON文件
    #[arg(long)]
    summary_json: Option<PathBuf>,

    /// 直方图区间数
    #[arg(long, default_value_t = DEFAULT_HISTOGRAM_BINS)]
    histogram_bins: usize,

    /// 只输出已有数据的汇总统计，不执行导入
    #[arg(long)]
    summary_only: bool,
}

impl Args {
    /// 命令行参数覆盖已加载的配置
    fn apply(&self, config: &mut IngestConfig) {
        if let Some(input) = &self.input {
            config.source.kind = SourceType::Local;
            config.source.root = input.clone();
        }
        if let Some(bucket) = &self.bucket {
            config.source.kind = SourceType::S3;
            config.source.bucket = Some(bucket.clone());
        }
        if let Some(prefix) = &self.prefix {
            config.source.prefix = Some(prefix.clone());
        }
        if let Some(output) = &self.output {
            config.output.root = output.clone();
        }
        if let Some(database) = &self.database {
            config.database.url = database.clone();
        }
        if let Some(mode) = self.mode {
            config.output.mode = mode.into();
        }
        if let Some(workers) = self.workers {
            config.pipeline.workers = workers;
        }
        if let Some(batch_size) = self.batch_size {
            config.pipeline.batch_size = batch_size;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

/// `--summary-json` 的输出内容
#[derive(Serialize)]
struct SummaryDump<'a> {
    statistics: &'a Statistics,
    slice_thickness_histogram: &'a [HistogramBin],
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a IngestReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志；配置文件中的级别在加载后生效
    let initial_level = args.log_level.as_deref().unwrap_or("info");
    let (filter, filter_handle) = reload::Layer::new(EnvFilter::new(initial_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let mut config = IngestConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);
    if config.logging.level != initial_level {
        filter_handle
            .reload(EnvFilter::new(&config.logging.level))
            .context("applying configured log level")?;
    }

    config.validate().context("invalid configuration")?;

    let pool = DatabasePool::connect(&config.database)
        .await
        .context("connecting to the metadata database")?;
    DatabaseQueries::new(&pool)
        .create_tables()
        .await
        .context("creating database schema")?;

    let report = if args.summary_only {
        None
    } else {
        Some(ingest(&config, &pool).await?)
    };

    let reporter = SummaryReporter::new(&pool);
    let statistics = reporter.summarize().await.context("computing summary")?;
    println!("{}", statistics);

    if let Some(path) = &args.summary_json {
        let histogram = reporter
            .thickness_histogram(args.histogram_bins)
            .await
            .context("computing slice thickness histogram")?;
        let dump = SummaryDump {
            statistics: &statistics,
            slice_thickness_histogram: &histogram,
            report: report.as_ref(),
        };
        let json = serde_json::to_string_pretty(&dump)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!("Summary written to {}", path.display());
    }

    pool.close().await;
    Ok(())
}

async fn ingest(config: &IngestConfig, pool: &DatabasePool) -> Result<IngestReport> {
    let source = open_source(&config.source).context("opening input source")?;
    let organizer = HierarchyOrganizer::new(config.output.root.clone(), config.output.mode);
    let pipeline = IngestPipeline::new(source, organizer, pool, config.pipeline.clone());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing files in flight before stopping");
            on_interrupt.cancel();
        }
    });

    let report = pipeline.run(cancel).await.context("ingestion run failed")?;
    println!("{}", report);
    for (kind, count) in report.counts_by_kind() {
        info!("{} events: {}", kind, count);
    }
    println!();
    Ok(report)
}
