//! 端到端测试的公共夹具

#![allow(dead_code)]

use dicom_ingest_core::config::{OutputMode, PipelineConfig};
use dicom_ingest_core::ObjectSource;
use dicom_ingest_database::{DatabasePool, DatabaseQueries};
use dicom_ingest_dicom::SyntheticInstance;
use dicom_ingest_pipeline::IngestPipeline;
use dicom_ingest_storage::{HierarchyOrganizer, LocalSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub struct Workspace {
    _dir: TempDir,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("lidc_small_dset");
        let output = dir.path().join("organized");
        std::fs::create_dir_all(&input).unwrap();
        Self {
            _dir: dir,
            input,
            output,
        }
    }

    /// 在输入目录下写入文件，`relative` 可以包含子目录
    pub fn write(&self, relative: &str, bytes: &[u8]) -> PathBuf {
        let path = self.input.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn write_instance(&self, relative: &str, instance: &SyntheticInstance) -> Vec<u8> {
        let bytes = instance.to_bytes().unwrap();
        self.write(relative, &bytes);
        bytes
    }

    pub fn local_source(&self) -> Arc<dyn ObjectSource> {
        Arc::new(LocalSource::new(&self.input, vec!["dcm".to_string()]))
    }

    /// 输出目录下的全部文件（不含临时文件）
    pub fn organized_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        collect_files(&self.output, &mut files);
        files.sort();
        files
    }
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect_files(&path, files);
        } else {
            files.push(path);
        }
    }
}

pub async fn database() -> DatabasePool {
    let pool = DatabasePool::in_memory().await.unwrap();
    DatabaseQueries::new(&pool).create_tables().await.unwrap();
    pool
}

pub async fn slice_count(pool: &DatabasePool, series_uid: &str) -> u32 {
    DatabaseQueries::new(pool)
        .get_series(series_uid)
        .await
        .unwrap()
        .unwrap()
        .number_of_slices
}

pub fn settings(batch_size: usize) -> PipelineConfig {
    PipelineConfig {
        workers: 4,
        batch_size,
        header_probe_bytes: 1024,
    }
}

pub fn pipeline(
    source: Arc<dyn ObjectSource>,
    output: &Path,
    mode: OutputMode,
    pool: &DatabasePool,
    batch_size: usize,
) -> IngestPipeline {
    IngestPipeline::new(
        source,
        HierarchyOrganizer::new(output, mode),
        pool,
        settings(batch_size),
    )
}

/// 一个患者、一个检查下的切片
pub fn slice(patient_id: &str, study_uid: &str, series_uid: &str) -> SyntheticInstance {
    SyntheticInstance::new(patient_id, study_uid, series_uid)
        .with_patient_name("Anonymous^Patient")
        .with_slice_thickness("2.5")
        .with_pixel_spacing("0.703125\\0.703125")
        .with_pixel_data(4096)
}
