//! 元数据字段映射
//!
//! 字段名到标签、值类型的固定映射表。所有取值都经过带默认回退的类型化访问器，
//! 缺失或无法解析的值一律为 `None`，不会被静默替换为0。

use chrono::NaiveDate;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use dicom_ingest_core::PixelSpacing;
use tracing::debug;

/// 字段值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    /// DA，YYYYMMDD
    Date,
    /// DS
    Decimal,
    /// IS
    Integer,
    /// 双值DS，如 PixelSpacing
    DecimalPair,
}

/// 单个字段的映射定义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub tag: Tag,
    pub field_type: FieldType,
    /// 必需字段缺失或为空时文件无效
    pub mandatory: bool,
}

const fn field(name: &'static str, tag: Tag, field_type: FieldType, mandatory: bool) -> FieldSpec {
    FieldSpec {
        name,
        tag,
        field_type,
        mandatory,
    }
}

// === 患者 ===
pub const PATIENT_ID: FieldSpec = field("PatientID", tags::PATIENT_ID, FieldType::Text, true);
pub const PATIENT_NAME: FieldSpec = field("PatientName", tags::PATIENT_NAME, FieldType::Text, false);
pub const PATIENT_BIRTH_DATE: FieldSpec =
    field("PatientBirthDate", tags::PATIENT_BIRTH_DATE, FieldType::Date, false);
pub const PATIENT_SEX: FieldSpec = field("PatientSex", tags::PATIENT_SEX, FieldType::Text, false);

// === 检查 ===
pub const STUDY_INSTANCE_UID: FieldSpec =
    field("StudyInstanceUID", tags::STUDY_INSTANCE_UID, FieldType::Text, true);
pub const STUDY_DATE: FieldSpec = field("StudyDate", tags::STUDY_DATE, FieldType::Date, false);
pub const STUDY_DESCRIPTION: FieldSpec =
    field("StudyDescription", tags::STUDY_DESCRIPTION, FieldType::Text, false);
pub const MODALITY: FieldSpec = field("Modality", tags::MODALITY, FieldType::Text, false);

// === 序列 ===
pub const SERIES_INSTANCE_UID: FieldSpec =
    field("SeriesInstanceUID", tags::SERIES_INSTANCE_UID, FieldType::Text, true);
pub const SERIES_NUMBER: FieldSpec =
    field("SeriesNumber", tags::SERIES_NUMBER, FieldType::Integer, false);
pub const SLICE_THICKNESS: FieldSpec =
    field("SliceThickness", tags::SLICE_THICKNESS, FieldType::Decimal, false);
pub const PIXEL_SPACING: FieldSpec =
    field("PixelSpacing", tags::PIXEL_SPACING, FieldType::DecimalPair, false);

// === 实例 ===
pub const SOP_INSTANCE_UID: FieldSpec =
    field("SOPInstanceUID", tags::SOP_INSTANCE_UID, FieldType::Text, false);

/// 完整映射表
pub const FIELDS: &[FieldSpec] = &[
    PATIENT_ID,
    PATIENT_NAME,
    PATIENT_BIRTH_DATE,
    PATIENT_SEX,
    STUDY_INSTANCE_UID,
    STUDY_DATE,
    STUDY_DESCRIPTION,
    MODALITY,
    SERIES_INSTANCE_UID,
    SERIES_NUMBER,
    SLICE_THICKNESS,
    PIXEL_SPACING,
    SOP_INSTANCE_UID,
];

/// 必需字段
pub fn mandatory_fields() -> impl Iterator<Item = &'static FieldSpec> {
    FIELDS.iter().filter(|spec| spec.mandatory)
}

/// 类型化的文件头读取器
pub struct HeaderReader<'a> {
    object: &'a InMemDicomObject,
}

impl<'a> HeaderReader<'a> {
    pub fn new(object: &'a InMemDicomObject) -> Self {
        Self { object }
    }

    /// 第一个缺失或为空的必需字段
    pub fn first_missing_mandatory(&self) -> Option<&'static FieldSpec> {
        mandatory_fields().find(|spec| self.text(spec).is_none())
    }

    /// 去除填充字符后的非空文本
    pub fn text(&self, spec: &FieldSpec) -> Option<String> {
        let element = self.object.element(spec.tag).ok()?;
        let value = element.to_str().ok()?;
        let trimmed = value.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn date(&self, spec: &FieldSpec) -> Option<NaiveDate> {
        let text = self.text(spec)?;
        match NaiveDate::parse_from_str(&text, "%Y%m%d") {
            Ok(date) => Some(date),
            Err(_) => {
                debug!("{} is not a DICOM date: {:?}", spec.name, text);
                None
            }
        }
    }

    /// 多值时取第一个值
    pub fn decimal(&self, spec: &FieldSpec) -> Option<f64> {
        let text = self.text(spec)?;
        let first = text.split('\\').next()?.trim();
        match first.parse::<f64>() {
            Ok(value) if value.is_finite() => Some(value),
            _ => {
                debug!("{} is not a decimal: {:?}", spec.name, text);
                None
            }
        }
    }

    pub fn integer(&self, spec: &FieldSpec) -> Option<i32> {
        let text = self.text(spec)?;
        let first = text.split('\\').next()?.trim();
        match first.parse::<i32>() {
            Ok(value) => Some(value),
            Err(_) => {
                debug!("{} is not an integer: {:?}", spec.name, text);
                None
            }
        }
    }

    pub fn pixel_spacing(&self, spec: &FieldSpec) -> Option<PixelSpacing> {
        let text = self.text(spec)?;
        let spacing = PixelSpacing::parse(&text);
        if spacing.is_none() {
            debug!("{} is not a decimal pair: {:?}", spec.name, text);
        }
        spacing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, VR};

    fn object_with(elements: Vec<(Tag, VR, &str)>) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(
            elements
                .into_iter()
                .map(|(tag, vr, value)| DataElement::new(tag, vr, PrimitiveValue::from(value))),
        )
    }

    #[test]
    fn test_mandatory_fields_are_the_three_keys() {
        let names: Vec<_> = mandatory_fields().map(|spec| spec.name).collect();
        assert_eq!(names, vec!["PatientID", "StudyInstanceUID", "SeriesInstanceUID"]);
    }

    #[test]
    fn test_typed_accessors() {
        let object = object_with(vec![
            (tags::PATIENT_ID, VR::LO, "LIDC-IDRI-0001 "),
            (tags::STUDY_DATE, VR::DA, "20000101"),
            (tags::SLICE_THICKNESS, VR::DS, "0"),
            (tags::SERIES_NUMBER, VR::IS, " 3000566"),
            (tags::PIXEL_SPACING, VR::DS, "0.703125\\0.703125"),
        ]);
        let reader = HeaderReader::new(&object);

        assert_eq!(reader.text(&PATIENT_ID).as_deref(), Some("LIDC-IDRI-0001"));
        assert_eq!(reader.date(&STUDY_DATE), NaiveDate::from_ymd_opt(2000, 1, 1));
        assert_eq!(reader.decimal(&SLICE_THICKNESS), Some(0.0));
        assert_eq!(reader.integer(&SERIES_NUMBER), Some(3000566));
        assert_eq!(
            reader.pixel_spacing(&PIXEL_SPACING),
            Some(PixelSpacing {
                row: 0.703125,
                column: 0.703125
            })
        );
    }

    #[test]
    fn test_unparseable_values_fall_back_to_none() {
        let object = object_with(vec![
            (tags::STUDY_DATE, VR::DA, "2000-13-45"),
            (tags::SLICE_THICKNESS, VR::DS, "thin"),
            (tags::PATIENT_ID, VR::LO, "   "),
        ]);
        let reader = HeaderReader::new(&object);

        assert_eq!(reader.date(&STUDY_DATE), None);
        assert_eq!(reader.decimal(&SLICE_THICKNESS), None);
        assert_eq!(reader.integer(&SERIES_NUMBER), None);
        assert_eq!(reader.first_missing_mandatory().map(|s| s.name), Some("PatientID"));
    }
}
