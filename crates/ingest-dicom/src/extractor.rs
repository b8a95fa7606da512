//! 元数据提取
//!
//! 把已通过验证的文件头映射为患者、检查、序列记录。

use crate::schema::{self, HeaderReader};
use crate::validator::DicomHeader;
use dicom_ingest_core::utils::is_valid_dicom_uid;
use dicom_ingest_core::{
    ExtractedRecord, IngestError, PatientRecord, Result, SeriesFragment, Sex, StudyRecord,
};
use tracing::{debug, error, warn};

/// 元数据提取器
#[derive(Debug, Clone, Default)]
pub struct MetadataExtractor;

impl MetadataExtractor {
    pub fn new() -> Self {
        Self
    }

    /// 按字段映射表提取记录
    ///
    /// 必需字段缺失时返回 `MetadataIncomplete`。验证通过的文件不应出现这种情况，
    /// 出现时按内部不一致处理：记录日志并跳过该文件。
    pub fn extract(&self, location: &str, header: &DicomHeader) -> Result<ExtractedRecord> {
        let reader = header.reader();

        let patient_id = required(&reader, location, &schema::PATIENT_ID)?;
        let study_uid = required(&reader, location, &schema::STUDY_INSTANCE_UID)?;
        let series_uid = required(&reader, location, &schema::SERIES_INSTANCE_UID)?;

        for uid in [&study_uid, &series_uid] {
            if !is_valid_dicom_uid(uid) {
                warn!("{} carries a non-conforming UID: {}", location, uid);
            }
        }

        let sex = reader.text(&schema::PATIENT_SEX).and_then(|code| {
            let sex = Sex::from_code(&code);
            if sex.is_none() {
                debug!("Unrecognized PatientSex {:?} in {}", code, location);
            }
            sex
        });
        let modality = reader.text(&schema::MODALITY);

        let record = ExtractedRecord {
            patient: PatientRecord {
                patient_id: patient_id.clone(),
                patient_name: reader.text(&schema::PATIENT_NAME),
                birth_date: reader.date(&schema::PATIENT_BIRTH_DATE),
                sex,
            },
            study: StudyRecord {
                study_instance_uid: study_uid.clone(),
                patient_id,
                study_date: reader.date(&schema::STUDY_DATE),
                study_description: reader.text(&schema::STUDY_DESCRIPTION),
                modality: modality.clone(),
            },
            series: SeriesFragment {
                series_instance_uid: series_uid,
                study_instance_uid: study_uid,
                series_number: reader.integer(&schema::SERIES_NUMBER),
                slice_thickness: reader.decimal(&schema::SLICE_THICKNESS),
                pixel_spacing: reader.pixel_spacing(&schema::PIXEL_SPACING),
                modality,
            },
            sop_instance_uid: reader.text(&schema::SOP_INSTANCE_UID),
        };

        debug!(
            "Extracted {} -> patient {}, study {}, series {}",
            location,
            record.patient.patient_id,
            record.study.study_instance_uid,
            record.series.series_instance_uid
        );
        Ok(record)
    }
}

fn required(reader: &HeaderReader<'_>, location: &str, spec: &schema::FieldSpec) -> Result<String> {
    reader.text(spec).ok_or_else(|| {
        error!(
            "Internal inconsistency: validated file {} lacks {}",
            location, spec.name
        );
        IngestError::MetadataIncomplete {
            location: location.to_string(),
            field: spec.name,
        }
    })
}
