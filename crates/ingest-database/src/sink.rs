//! 批次持久化
//!
//! 每个批次在一个事务中写入，按 患者 -> 检查 -> 序列 的顺序处理，保证外键所指记录先于引用者存在。
//! 已存在的记录按“先写入者优先”合并：空属性被新值补齐，冲突的新值被忽略并报告。
//! 序列的切片数是 `series_files` 表中该序列不同内容哈希的数量，跨运行累计，重复提交同一文件不改变结果。

use crate::connection::DatabasePool;
use crate::queries::{fetch_patient, fetch_series, fetch_study};
use dicom_ingest_core::{
    CommitReport, EntityKind, IngestError, LinkedBatch, PatientRecord, RejectedRecord, Result,
    SeriesRecord, StudyRecord,
};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

/// 记录写入器
#[derive(Debug, Clone)]
pub struct PersistenceSink {
    pool: SqlitePool,
}

impl PersistenceSink {
    pub fn new(pool: &DatabasePool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    /// 在单个事务中提交批次
    ///
    /// 引用不存在或与已有记录冲突的检查、序列被拒绝并记录在报告中，不影响批次其余部分。
    /// 数据库错误回滚整个批次并返回 `CommitFailure`。
    pub async fn commit(&self, batch: &LinkedBatch) -> Result<CommitReport> {
        let mut report = CommitReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IngestError::CommitFailure(e.to_string()))?;

        if let Err(e) = write_batch(&mut tx, batch, &mut report).await {
            error!("Batch of {} records failed, rolling back: {}", batch.len(), e);
            if let Err(rollback) = tx.rollback().await {
                warn!("Rollback failed: {}", rollback);
            }
            return Err(IngestError::CommitFailure(e.to_string()));
        }

        tx.commit()
            .await
            .map_err(|e| IngestError::CommitFailure(e.to_string()))?;

        info!(
            "Committed batch: inserted {} patients, {} studies, {} series; updated {}; rejected {}",
            report.inserted.patients,
            report.inserted.studies,
            report.inserted.series,
            report.updated.total(),
            report.rejected.len()
        );
        Ok(report)
    }
}

async fn write_batch(
    conn: &mut SqliteConnection,
    batch: &LinkedBatch,
    report: &mut CommitReport,
) -> sqlx::Result<()> {
    for patient in &batch.patients {
        write_patient(conn, patient, report).await?;
    }

    let mut rejected_studies = HashSet::new();
    for study in &batch.studies {
        if !write_study(conn, study, report).await? {
            rejected_studies.insert(study.study_instance_uid.as_str());
        }
    }

    let mut files: HashMap<&str, Vec<&str>> = HashMap::new();
    for file in &batch.series_files {
        files
            .entry(file.series_instance_uid.as_str())
            .or_default()
            .push(file.content_hash.as_str());
    }

    for series in &batch.series {
        if rejected_studies.contains(series.study_instance_uid.as_str()) {
            reject(
                report,
                EntityKind::Series,
                &series.series_instance_uid,
                format!("parent study {} was rejected", series.study_instance_uid),
            );
            continue;
        }
        let series_files = files
            .get(series.series_instance_uid.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default();
        write_series(conn, series, series_files, report).await?;
    }
    Ok(())
}

async fn write_patient(
    conn: &mut SqliteConnection,
    patient: &PatientRecord,
    report: &mut CommitReport,
) -> sqlx::Result<()> {
    match fetch_patient(&mut *conn, &patient.patient_id).await? {
        None => {
            sqlx::query(
                r#"
                INSERT INTO patients (patient_id, patient_name, birth_date, sex)
                VALUES (?1, ?2, ?3, ?4)
            "#,
            )
            .bind(&patient.patient_id)
            .bind(&patient.patient_name)
            .bind(patient.birth_date)
            .bind(patient.sex.map(|s| s.code()))
            .execute(&mut *conn)
            .await?;
            report.inserted.patients += 1;
        }
        Some(existing) => {
            let before = PatientRecord::from(existing);
            let mut merged = before.clone();
            report.conflicts.extend(merged.merge_from(patient));
            if merged == before {
                report.unchanged.patients += 1;
                return Ok(());
            }
            sqlx::query(
                r#"
                UPDATE patients SET patient_name = ?2, birth_date = ?3, sex = ?4
                WHERE patient_id = ?1
            "#,
            )
            .bind(&merged.patient_id)
            .bind(&merged.patient_name)
            .bind(merged.birth_date)
            .bind(merged.sex.map(|s| s.code()))
            .execute(&mut *conn)
            .await?;
            report.updated.patients += 1;
        }
    }
    Ok(())
}

/// 返回 false 表示检查被拒绝
async fn write_study(
    conn: &mut SqliteConnection,
    study: &StudyRecord,
    report: &mut CommitReport,
) -> sqlx::Result<bool> {
    if fetch_patient(&mut *conn, &study.patient_id).await?.is_none() {
        reject(
            report,
            EntityKind::Study,
            &study.study_instance_uid,
            format!("patient {} does not exist", study.patient_id),
        );
        return Ok(false);
    }

    match fetch_study(&mut *conn, &study.study_instance_uid).await? {
        None => {
            sqlx::query(
                r#"
                INSERT INTO studies (study_instance_uid, patient_id, study_date, study_description, modality)
                VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            )
            .bind(&study.study_instance_uid)
            .bind(&study.patient_id)
            .bind(study.study_date)
            .bind(&study.study_description)
            .bind(&study.modality)
            .execute(&mut *conn)
            .await?;
            report.inserted.studies += 1;
        }
        Some(existing) if existing.patient_id != study.patient_id => {
            reject(
                report,
                EntityKind::Study,
                &study.study_instance_uid,
                format!(
                    "already belongs to patient {}, not {}",
                    existing.patient_id, study.patient_id
                ),
            );
            return Ok(false);
        }
        Some(existing) => {
            let before = StudyRecord::from(existing);
            let mut merged = before.clone();
            report.conflicts.extend(merged.merge_from(study));
            if merged == before {
                report.unchanged.studies += 1;
                return Ok(true);
            }
            sqlx::query(
                r#"
                UPDATE studies SET study_date = ?2, study_description = ?3, modality = ?4
                WHERE study_instance_uid = ?1
            "#,
            )
            .bind(&merged.study_instance_uid)
            .bind(merged.study_date)
            .bind(&merged.study_description)
            .bind(&merged.modality)
            .execute(&mut *conn)
            .await?;
            report.updated.studies += 1;
        }
    }
    Ok(true)
}

async fn write_series(
    conn: &mut SqliteConnection,
    series: &SeriesRecord,
    files: &[&str],
    report: &mut CommitReport,
) -> sqlx::Result<()> {
    if fetch_study(&mut *conn, &series.study_instance_uid).await?.is_none() {
        reject(
            report,
            EntityKind::Series,
            &series.series_instance_uid,
            format!("study {} does not exist", series.study_instance_uid),
        );
        return Ok(());
    }

    match fetch_series(&mut *conn, &series.series_instance_uid).await? {
        None => {
            sqlx::query(
                r#"
                INSERT INTO series (series_instance_uid, study_instance_uid, series_number,
                                    slice_thickness, pixel_spacing, modality, number_of_slices)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
            "#,
            )
            .bind(&series.series_instance_uid)
            .bind(&series.study_instance_uid)
            .bind(series.series_number)
            .bind(series.slice_thickness)
            .bind(series.pixel_spacing.map(|s| s.to_string()))
            .bind(&series.modality)
            .execute(&mut *conn)
            .await?;
            let slices = record_files(conn, &series.series_instance_uid, files).await?;
            sqlx::query("UPDATE series SET number_of_slices = ?2 WHERE series_instance_uid = ?1")
                .bind(&series.series_instance_uid)
                .bind(slices)
                .execute(&mut *conn)
                .await?;
            report.inserted.series += 1;
        }
        Some(existing) if existing.study_instance_uid != series.study_instance_uid => {
            reject(
                report,
                EntityKind::Series,
                &series.series_instance_uid,
                format!(
                    "already belongs to study {}, not {}",
                    existing.study_instance_uid, series.study_instance_uid
                ),
            );
        }
        Some(existing) => {
            let before = SeriesRecord::from(existing);
            let mut merged = before.clone();
            report.conflicts.extend(merged.merge_from(series));
            let slices = record_files(conn, &series.series_instance_uid, files).await?;
            merged.number_of_slices = u32::try_from(slices).unwrap_or(u32::MAX);
            if merged == before {
                report.unchanged.series += 1;
                return Ok(());
            }
            sqlx::query(
                r#"
                UPDATE series SET series_number = ?2, slice_thickness = ?3, pixel_spacing = ?4,
                                  modality = ?5, number_of_slices = ?6
                WHERE series_instance_uid = ?1
            "#,
            )
            .bind(&merged.series_instance_uid)
            .bind(merged.series_number)
            .bind(merged.slice_thickness)
            .bind(merged.pixel_spacing.map(|s| s.to_string()))
            .bind(&merged.modality)
            .bind(i64::from(merged.number_of_slices))
            .execute(&mut *conn)
            .await?;
            debug!(
                "Series {} now has {} slices",
                merged.series_instance_uid, merged.number_of_slices
            );
            report.updated.series += 1;
        }
    }
    Ok(())
}

/// 记录序列文件，返回该序列已知的不同文件数
async fn record_files(
    conn: &mut SqliteConnection,
    series_uid: &str,
    files: &[&str],
) -> sqlx::Result<i64> {
    for content_hash in files {
        sqlx::query(
            "INSERT OR IGNORE INTO series_files (series_instance_uid, content_hash) VALUES (?1, ?2)",
        )
        .bind(series_uid)
        .bind(*content_hash)
        .execute(&mut *conn)
        .await?;
    }
    let row = sqlx::query("SELECT COUNT(*) AS slices FROM series_files WHERE series_instance_uid = ?1")
        .bind(series_uid)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.get("slices"))
}

fn reject(report: &mut CommitReport, entity: EntityKind, key: &str, reason: String) {
    warn!("Rejected {} {}: {}", entity, key, reason);
    report.rejected.push(RejectedRecord {
        entity,
        key: key.to_string(),
        reason,
    });
}
