//! 合成DICOM实例
//!
//! 生成结构合法的Part 10文件字节，用于测试和演示数据集。

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_ingest_core::utils::generate_dicom_uid;
use dicom_ingest_core::{IngestError, Result};

/// 合成实例构建器
#[derive(Debug, Clone)]
pub struct SyntheticInstance {
    patient_id: String,
    study_uid: String,
    series_uid: Option<String>,
    sop_instance_uid: String,
    patient_name: Option<String>,
    patient_sex: Option<String>,
    patient_birth_date: Option<String>,
    study_date: Option<String>,
    study_description: Option<String>,
    modality: Option<String>,
    series_number: Option<String>,
    slice_thickness: Option<String>,
    pixel_spacing: Option<String>,
    pixel_bytes: usize,
}

impl SyntheticInstance {
    pub fn new(patient_id: &str, study_uid: &str, series_uid: &str) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            study_uid: study_uid.to_string(),
            series_uid: Some(series_uid.to_string()),
            sop_instance_uid: generate_dicom_uid(),
            patient_name: None,
            patient_sex: None,
            patient_birth_date: None,
            study_date: None,
            study_description: None,
            modality: Some("CT".to_string()),
            series_number: None,
            slice_thickness: None,
            pixel_spacing: None,
            pixel_bytes: 0,
        }
    }

    pub fn with_sop_instance_uid(mut self, uid: &str) -> Self {
        self.sop_instance_uid = uid.to_string();
        self
    }

    pub fn with_patient_name(mut self, name: &str) -> Self {
        self.patient_name = Some(name.to_string());
        self
    }

    pub fn with_patient_sex(mut self, sex: &str) -> Self {
        self.patient_sex = Some(sex.to_string());
        self
    }

    pub fn with_patient_birth_date(mut self, date: &str) -> Self {
        self.patient_birth_date = Some(date.to_string());
        self
    }

    pub fn with_study_date(mut self, date: &str) -> Self {
        self.study_date = Some(date.to_string());
        self
    }

    pub fn with_study_description(mut self, description: &str) -> Self {
        self.study_description = Some(description.to_string());
        self
    }

    pub fn with_series_number(mut self, number: &str) -> Self {
        self.series_number = Some(number.to_string());
        self
    }

    pub fn with_slice_thickness(mut self, thickness: &str) -> Self {
        self.slice_thickness = Some(thickness.to_string());
        self
    }

    pub fn with_pixel_spacing(mut self, spacing: &str) -> Self {
        self.pixel_spacing = Some(spacing.to_string());
        self
    }

    /// 追加指定字节数的像素数据
    pub fn with_pixel_data(mut self, bytes: usize) -> Self {
        self.pixel_bytes = bytes;
        self
    }

    pub fn without_series_uid(mut self) -> Self {
        self.series_uid = None;
        self
    }

    pub fn sop_instance_uid(&self) -> &str {
        &self.sop_instance_uid
    }

    /// 编码为显式VR小端的Part 10文件
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut obj = InMemDicomObject::new_empty();

        put_text(&mut obj, tags::SOP_CLASS_UID, VR::UI, Some(uids::CT_IMAGE_STORAGE));
        put_text(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, Some(&self.sop_instance_uid));
        put_text(&mut obj, tags::STUDY_DATE, VR::DA, self.study_date.as_deref());
        put_text(&mut obj, tags::MODALITY, VR::CS, self.modality.as_deref());
        put_text(
            &mut obj,
            tags::STUDY_DESCRIPTION,
            VR::LO,
            self.study_description.as_deref(),
        );
        put_text(&mut obj, tags::PATIENT_NAME, VR::PN, self.patient_name.as_deref());
        put_text(&mut obj, tags::PATIENT_ID, VR::LO, Some(&self.patient_id));
        put_text(
            &mut obj,
            tags::PATIENT_BIRTH_DATE,
            VR::DA,
            self.patient_birth_date.as_deref(),
        );
        put_text(&mut obj, tags::PATIENT_SEX, VR::CS, self.patient_sex.as_deref());
        put_text(
            &mut obj,
            tags::SLICE_THICKNESS,
            VR::DS,
            self.slice_thickness.as_deref(),
        );
        put_text(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, Some(&self.study_uid));
        put_text(
            &mut obj,
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            self.series_uid.as_deref(),
        );
        put_text(&mut obj, tags::SERIES_NUMBER, VR::IS, self.series_number.as_deref());
        put_text(&mut obj, tags::PIXEL_SPACING, VR::DS, self.pixel_spacing.as_deref());
        if self.pixel_bytes > 0 {
            obj.put(DataElement::new(
                tags::PIXEL_DATA,
                VR::OB,
                PrimitiveValue::U8(vec![0u8; self.pixel_bytes].into()),
            ));
        }

        let file = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(self.sop_instance_uid.as_str()),
            )
            .map_err(encode_error)?;

        let mut bytes = Vec::new();
        file.write_all(&mut bytes).map_err(encode_error)?;
        Ok(bytes)
    }
}

fn put_text(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: Option<&str>) {
    if let Some(value) = value {
        obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }
}

fn encode_error(err: impl std::fmt::Display) -> IngestError {
    IngestError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("failed to encode synthetic instance: {}", err),
    ))
}
