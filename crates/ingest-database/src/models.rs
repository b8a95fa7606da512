//! 数据库模型

use chrono::NaiveDate;
use dicom_ingest_core::models::*;
use sqlx::FromRow;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库患者表
#[derive(Debug, Clone, FromRow)]
pub struct DbPatient {
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub sex: Option<String>, // 存储为DICOM代码，转换为Sex枚举
}

impl From<DbPatient> for PatientRecord {
    fn from(db_patient: DbPatient) -> Self {
        PatientRecord {
            patient_id: db_patient.patient_id,
            patient_name: db_patient.patient_name,
            birth_date: db_patient.birth_date,
            sex: db_patient.sex.as_deref().and_then(Sex::from_code),
        }
    }
}

/// 数据库检查表
#[derive(Debug, Clone, FromRow)]
pub struct DbStudy {
    pub study_instance_uid: String,
    pub patient_id: String,
    pub study_date: Option<NaiveDate>,
    pub study_description: Option<String>,
    pub modality: Option<String>,
}

impl From<DbStudy> for StudyRecord {
    fn from(db_study: DbStudy) -> Self {
        StudyRecord {
            study_instance_uid: db_study.study_instance_uid,
            patient_id: db_study.patient_id,
            study_date: db_study.study_date,
            study_description: db_study.study_description,
            modality: db_study.modality,
        }
    }
}

/// 数据库序列表
#[derive(Debug, Clone, FromRow)]
pub struct DbSeries {
    pub series_instance_uid: String,
    pub study_instance_uid: String,
    pub series_number: Option<i32>,
    pub slice_thickness: Option<f64>,
    pub pixel_spacing: Option<String>, // `行\列`
    pub modality: Option<String>,
    pub number_of_slices: i64,
}

impl From<DbSeries> for SeriesRecord {
    fn from(db_series: DbSeries) -> Self {
        SeriesRecord {
            series_instance_uid: db_series.series_instance_uid,
            study_instance_uid: db_series.study_instance_uid,
            series_number: db_series.series_number,
            slice_thickness: db_series.slice_thickness,
            pixel_spacing: db_series.pixel_spacing.as_deref().and_then(PixelSpacing::parse),
            modality: db_series.modality,
            number_of_slices: u32::try_from(db_series.number_of_slices.max(0)).unwrap_or(u32::MAX),
        }
    }
}
