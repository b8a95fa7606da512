//! 汇总统计
//!
//! 只读聚合已提交的数据，空库时计数为0、平均值为0.0，切片厚度统计为 `None`。

use crate::connection::DatabasePool;
use dicom_ingest_core::{HistogramBin, IngestError, Result, Statistics};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::debug;

/// 默认直方图区间数
pub const DEFAULT_HISTOGRAM_BINS: usize = 10;

/// 汇总统计器
#[derive(Debug, Clone)]
pub struct SummaryReporter {
    pool: SqlitePool,
}

impl SummaryReporter {
    pub fn new(pool: &DatabasePool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    /// 计算汇总统计
    pub async fn summarize(&self) -> Result<Statistics> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM patients) AS total_patients,
                (SELECT COUNT(*) FROM studies) AS total_studies,
                (SELECT COUNT(*) FROM series) AS total_series,
                (SELECT COALESCE(SUM(number_of_slices), 0) FROM series) AS total_slices,
                (SELECT MIN(slice_thickness) FROM series WHERE slice_thickness IS NOT NULL) AS thickness_min,
                (SELECT MAX(slice_thickness) FROM series WHERE slice_thickness IS NOT NULL) AS thickness_max,
                (SELECT AVG(slice_thickness) FROM series WHERE slice_thickness IS NOT NULL) AS thickness_mean
        "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| IngestError::Database(e.to_string()))?;

        let count = |name: &str| -> Result<u64> {
            let value: i64 = row
                .try_get(name)
                .map_err(|e| IngestError::Database(e.to_string()))?;
            Ok(value.max(0) as u64)
        };
        let thickness = |name: &str| -> Result<Option<f64>> {
            row.try_get(name)
                .map_err(|e| IngestError::Database(e.to_string()))
        };

        let total_studies = count("total_studies")?;
        let total_slices = count("total_slices")?;
        let avg_slices_per_study = if total_studies == 0 {
            0.0
        } else {
            total_slices as f64 / total_studies as f64
        };

        let statistics = Statistics {
            total_patients: count("total_patients")?,
            total_studies,
            total_series: count("total_series")?,
            total_slices,
            avg_slices_per_study,
            slice_thickness_min: thickness("thickness_min")?,
            slice_thickness_max: thickness("thickness_max")?,
            slice_thickness_mean: thickness("thickness_mean")?,
        };
        debug!("Summary statistics: {:?}", statistics);
        Ok(statistics)
    }

    /// 切片厚度分布，供绘图使用
    pub async fn thickness_histogram(&self, bins: usize) -> Result<Vec<HistogramBin>> {
        let values: Vec<f64> = sqlx::query_scalar(
            "SELECT slice_thickness FROM series WHERE slice_thickness IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IngestError::Database(e.to_string()))?;

        Ok(histogram(&values, bins))
    }
}

/// 等宽直方图，区间覆盖 [最小值, 最大值]，最后一个区间包含上界
pub fn histogram(values: &[f64], bins: usize) -> Vec<HistogramBin> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if bins == 0 || finite.is_empty() {
        return Vec::new();
    }

    let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if min == max {
        return vec![HistogramBin {
            lower: min,
            upper: max,
            count: finite.len() as u64,
        }];
    }

    let width = (max - min) / bins as f64;
    let mut result: Vec<HistogramBin> = (0..bins)
        .map(|i| HistogramBin {
            lower: min + width * i as f64,
            upper: if i + 1 == bins {
                max
            } else {
                min + width * (i + 1) as f64
            },
            count: 0,
        })
        .collect();

    for value in finite {
        let index = (((value - min) / width) as usize).min(bins - 1);
        result[index].count += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::DatabaseQueries;
    use crate::sink::PersistenceSink;
    use dicom_ingest_core::{LinkedBatch, PatientRecord, SeriesFile, SeriesRecord, StudyRecord};

    fn study(uid: &str) -> StudyRecord {
        StudyRecord {
            study_instance_uid: uid.to_string(),
            patient_id: "P1".to_string(),
            study_date: None,
            study_description: None,
            modality: None,
        }
    }

    fn series(uid: &str, study_uid: &str, thickness: Option<f64>, slices: u32) -> SeriesRecord {
        SeriesRecord {
            series_instance_uid: uid.to_string(),
            study_instance_uid: study_uid.to_string(),
            series_number: None,
            slice_thickness: thickness,
            pixel_spacing: None,
            modality: None,
            number_of_slices: slices,
        }
    }

    /// 每个序列按其切片数生成不同的文件哈希
    fn files_for(series: &[SeriesRecord]) -> Vec<SeriesFile> {
        series
            .iter()
            .flat_map(|s| {
                (0..s.number_of_slices).map(move |n| SeriesFile {
                    series_instance_uid: s.series_instance_uid.clone(),
                    content_hash: format!("{}-{}", s.series_instance_uid, n),
                })
            })
            .collect()
    }

    async fn reporter_with(batch: LinkedBatch) -> SummaryReporter {
        let pool = DatabasePool::in_memory().await.unwrap();
        DatabaseQueries::new(&pool).create_tables().await.unwrap();
        PersistenceSink::new(&pool).commit(&batch).await.unwrap();
        SummaryReporter::new(&pool)
    }

    #[tokio::test]
    async fn test_empty_store() {
        let reporter = reporter_with(LinkedBatch::default()).await;
        let stats = reporter.summarize().await.unwrap();

        assert_eq!(stats, Statistics::default());
        assert!(reporter.thickness_histogram(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_summary_over_two_studies() {
        let series_rows = vec![
            series("1.1.1", "1.1", Some(1.0), 100),
            series("1.1.2", "1.1", Some(2.5), 50),
            series("1.2.1", "1.2", Some(1.0), 150),
            series("1.2.2", "1.2", None, 4),
        ];
        let reporter = reporter_with(LinkedBatch {
            patients: vec![PatientRecord {
                patient_id: "P1".to_string(),
                patient_name: None,
                birth_date: None,
                sex: None,
            }],
            studies: vec![study("1.1"), study("1.2")],
            series_files: files_for(&series_rows),
            series: series_rows,
        })
        .await;

        let stats = reporter.summarize().await.unwrap();
        assert_eq!(stats.total_studies, 2);
        assert_eq!(stats.total_series, 4);
        assert_eq!(stats.total_slices, 304);
        assert_eq!(stats.avg_slices_per_study, 152.0);
        assert_eq!(stats.slice_thickness_min, Some(1.0));
        assert_eq!(stats.slice_thickness_max, Some(2.5));
        assert_eq!(stats.slice_thickness_mean, Some(1.5));

        let bins = reporter.thickness_histogram(3).await.unwrap();
        assert_eq!(bins.len(), 3);
        assert_eq!(bins.iter().map(|b| b.count).collect::<Vec<_>>(), vec![2, 0, 1]);
    }

    #[test]
    fn test_histogram_edges() {
        assert!(histogram(&[1.0, 2.0], 0).is_empty());

        let single = histogram(&[2.5, 2.5, 2.5], 10);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].count, 3);

        let bins = histogram(&[0.0, 1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(bins[0].upper, 2.0);
        assert_eq!(bins[1].upper, 4.0);
        assert_eq!(bins[0].count + bins[1].count, 5);
        assert_eq!(bins[1].count, 3);
    }
}
