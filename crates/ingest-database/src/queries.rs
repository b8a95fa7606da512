//! 数据库查询操作

use crate::connection::DatabasePool;
use crate::models::*;
use dicom_ingest_core::{IngestError, KeyIndex, PatientRecord, Result, SeriesRecord, StudyRecord};
use sqlx::{Row, SqliteExecutor};

/// 数据库查询操作接口
pub struct DatabaseQueries<'a> {
    pool: &'a DatabasePool,
}

impl<'a> DatabaseQueries<'a> {
    pub fn new(pool: &'a DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        // 创建患者表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS patients (
                patient_id TEXT PRIMARY KEY,
                patient_name TEXT,
                birth_date TEXT,
                sex TEXT
            )
        "#,
        )
        .execute(pool)
        .await
        .map_err(|e| IngestError::Database(e.to_string()))?;

        // 创建检查表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS studies (
                study_instance_uid TEXT PRIMARY KEY,
                patient_id TEXT NOT NULL REFERENCES patients(patient_id),
                study_date TEXT,
                study_description TEXT,
                modality TEXT
            )
        "#,
        )
        .execute(pool)
        .await
        .map_err(|e| IngestError::Database(e.to_string()))?;

        // 创建序列表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS series (
                series_instance_uid TEXT PRIMARY KEY,
                study_instance_uid TEXT NOT NULL REFERENCES studies(study_instance_uid),
                series_number INTEGER,
                slice_thickness REAL,
                pixel_spacing TEXT,
                modality TEXT,
                number_of_slices INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(pool)
        .await
        .map_err(|e| IngestError::Database(e.to_string()))?;

        // 创建序列文件表，切片数为每个序列的不同内容哈希数
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS series_files (
                series_instance_uid TEXT NOT NULL REFERENCES series(series_instance_uid),
                content_hash TEXT NOT NULL,
                PRIMARY KEY (series_instance_uid, content_hash)
            )
        "#,
        )
        .execute(pool)
        .await
        .map_err(|e| IngestError::Database(e.to_string()))?;

        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_studies_patient_id ON studies(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_series_study_uid ON series(study_instance_uid)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql)
                .execute(pool)
                .await
                .map_err(|e| IngestError::Database(e.to_string()))?;
        }
        Ok(())
    }

    // ========== 单条记录查询 ==========

    /// 根据患者ID查找患者
    pub async fn get_patient(&self, patient_id: &str) -> Result<Option<PatientRecord>> {
        let result = fetch_patient(self.pool.pool(), patient_id)
            .await
            .map_err(|e| IngestError::Database(e.to_string()))?;
        Ok(result.map(PatientRecord::from))
    }

    /// 根据检查UID查找检查
    pub async fn get_study(&self, study_uid: &str) -> Result<Option<StudyRecord>> {
        let result = fetch_study(self.pool.pool(), study_uid)
            .await
            .map_err(|e| IngestError::Database(e.to_string()))?;
        Ok(result.map(StudyRecord::from))
    }

    /// 根据序列UID查找序列
    pub async fn get_series(&self, series_uid: &str) -> Result<Option<SeriesRecord>> {
        let result = fetch_series(self.pool.pool(), series_uid)
            .await
            .map_err(|e| IngestError::Database(e.to_string()))?;
        Ok(result.map(SeriesRecord::from))
    }

    /// 获取检查下的所有序列
    pub async fn get_series_by_study(&self, study_uid: &str) -> Result<Vec<SeriesRecord>> {
        let results = sqlx::query_as::<_, DbSeries>(
            "SELECT * FROM series WHERE study_instance_uid = ?1 ORDER BY series_number, series_instance_uid",
        )
        .bind(study_uid)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| IngestError::Database(e.to_string()))?;

        Ok(results.into_iter().map(SeriesRecord::from).collect())
    }

    // ========== 统计 ==========

    /// 三张表的行数 (患者, 检查, 序列)
    pub async fn count_rows(&self) -> Result<(i64, i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM patients) AS patients,
                (SELECT COUNT(*) FROM studies) AS studies,
                (SELECT COUNT(*) FROM series) AS series
        "#,
        )
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| IngestError::Database(e.to_string()))?;

        Ok((row.get("patients"), row.get("studies"), row.get("series")))
    }

    /// 读取已提交数据的主键关联，用于在运行开始时初始化关联器
    pub async fn load_key_index(&self) -> Result<KeyIndex> {
        let pool = self.pool.pool();
        let mut index = KeyIndex::default();

        let studies = sqlx::query("SELECT study_instance_uid, patient_id FROM studies")
            .fetch_all(pool)
            .await
            .map_err(|e| IngestError::Database(e.to_string()))?;
        for row in studies {
            index
                .studies
                .insert(row.get("study_instance_uid"), row.get("patient_id"));
        }

        let series = sqlx::query("SELECT series_instance_uid, study_instance_uid FROM series")
            .fetch_all(pool)
            .await
            .map_err(|e| IngestError::Database(e.to_string()))?;
        for row in series {
            index
                .series
                .insert(row.get("series_instance_uid"), row.get("study_instance_uid"));
        }

        tracing::debug!(
            "Loaded key index: {} studies, {} series",
            index.studies.len(),
            index.series.len()
        );
        Ok(index)
    }
}

// 以下查询同时用于连接池和事务

pub(crate) async fn fetch_patient<'e, E>(
    executor: E,
    patient_id: &str,
) -> sqlx::Result<Option<DbPatient>>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as::<_, DbPatient>("SELECT * FROM patients WHERE patient_id = ?1")
        .bind(patient_id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn fetch_study<'e, E>(executor: E, study_uid: &str) -> sqlx::Result<Option<DbStudy>>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as::<_, DbStudy>("SELECT * FROM studies WHERE study_instance_uid = ?1")
        .bind(study_uid)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn fetch_series<'e, E>(
    executor: E,
    series_uid: &str,
) -> sqlx::Result<Option<DbSeries>>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as::<_, DbSeries>("SELECT * FROM series WHERE series_instance_uid = ?1")
        .bind(series_uid)
        .fetch_optional(executor)
        .await
}
