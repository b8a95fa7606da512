//! 核心数据模型定义

use crate::error::{EntityKind, ErrorKind};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 性别枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
    Other,
}

impl Sex {
    /// 从DICOM代码字符串 (M/F/O) 解析
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "M" => Some(Sex::Male),
            "F" => Some(Sex::Female),
            "O" => Some(Sex::Other),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
            Sex::Other => "O",
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 像素间距（行间距, 列间距），单位mm
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelSpacing {
    pub row: f64,
    pub column: f64,
}

impl PixelSpacing {
    /// 解析 `行\列` 形式的文本
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split('\\').map(|p| p.trim().parse::<f64>());
        match (parts.next(), parts.next(), parts.next()) {
            (Some(Ok(row)), Some(Ok(column)), None) if row.is_finite() && column.is_finite() => {
                Some(Self { row, column })
            }
            _ => None,
        }
    }
}

impl fmt::Display for PixelSpacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\\{}", self.row, self.column)
    }
}

/// 患者记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub sex: Option<Sex>,
}

impl PatientRecord {
    /// 按“先写入者优先”策略合并另一条同ID记录，返回被忽略的冲突属性
    pub fn merge_from(&mut self, incoming: &PatientRecord) -> Vec<AttributeConflict> {
        let mut merge = Merge::new(EntityKind::Patient, &self.patient_id);
        merge.field("patient_name", &mut self.patient_name, &incoming.patient_name);
        merge.field("birth_date", &mut self.birth_date, &incoming.birth_date);
        merge.field("sex", &mut self.sex, &incoming.sex);
        merge.finish()
    }
}

/// 检查记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub study_instance_uid: String,
    pub patient_id: String,
    pub study_date: Option<NaiveDate>,
    pub study_description: Option<String>,
    pub modality: Option<String>,
}

impl StudyRecord {
    /// 合并非主键属性；`patient_id` 的一致性由调用方检查
    pub fn merge_from(&mut self, incoming: &StudyRecord) -> Vec<AttributeConflict> {
        let mut merge = Merge::new(EntityKind::Study, &self.study_instance_uid);
        merge.field("study_date", &mut self.study_date, &incoming.study_date);
        merge.field(
            "study_description",
            &mut self.study_description,
            &incoming.study_description,
        );
        merge.field("modality", &mut self.modality, &incoming.modality);
        merge.finish()
    }
}

/// 从单个文件提取的序列信息，尚不包含切片数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesFragment {
    pub series_instance_uid: String,
    pub study_instance_uid: String,
    pub series_number: Option<i32>,
    pub slice_thickness: Option<f64>,
    pub pixel_spacing: Option<PixelSpacing>,
    pub modality: Option<String>,
}

/// 序列记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub series_instance_uid: String,
    pub study_instance_uid: String,
    pub series_number: Option<i32>,
    pub slice_thickness: Option<f64>,
    pub pixel_spacing: Option<PixelSpacing>,
    pub modality: Option<String>,
    /// 映射到该序列的不同有效文件数量
    pub number_of_slices: u32,
}

impl SeriesRecord {
    pub fn from_fragment(fragment: SeriesFragment, number_of_slices: u32) -> Self {
        Self {
            series_instance_uid: fragment.series_instance_uid,
            study_instance_uid: fragment.study_instance_uid,
            series_number: fragment.series_number,
            slice_thickness: fragment.slice_thickness,
            pixel_spacing: fragment.pixel_spacing,
            modality: fragment.modality,
            number_of_slices,
        }
    }

    /// 合并非主键属性，切片数不参与合并
    pub fn merge_from(&mut self, incoming: &SeriesRecord) -> Vec<AttributeConflict> {
        let mut merge = Merge::new(EntityKind::Series, &self.series_instance_uid);
        merge.field("series_number", &mut self.series_number, &incoming.series_number);
        merge.field(
            "slice_thickness",
            &mut self.slice_thickness,
            &incoming.slice_thickness,
        );
        merge.field("pixel_spacing", &mut self.pixel_spacing, &incoming.pixel_spacing);
        merge.field("modality", &mut self.modality, &incoming.modality);
        merge.finish()
    }
}

/// 单个有效文件提取出的完整记录
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRecord {
    pub patient: PatientRecord,
    pub study: StudyRecord,
    pub series: SeriesFragment,
    pub sop_instance_uid: Option<String>,
}

/// 合并时被忽略的属性值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeConflict {
    pub entity: EntityKind,
    pub key: String,
    pub field: String,
    pub kept: String,
    pub ignored: String,
}

impl fmt::Display for AttributeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} kept {:?}, ignored {:?}",
            self.entity, self.key, self.field, self.kept, self.ignored
        )
    }
}

struct Merge<'a> {
    entity: EntityKind,
    key: &'a str,
    conflicts: Vec<AttributeConflict>,
}

impl<'a> Merge<'a> {
    fn new(entity: EntityKind, key: &'a str) -> Self {
        Self {
            entity,
            key,
            conflicts: Vec::new(),
        }
    }

    fn field<T>(&mut self, name: &str, existing: &mut Option<T>, incoming: &Option<T>)
    where
        T: Clone + PartialEq + fmt::Display,
    {
        match (existing.as_ref(), incoming) {
            (None, Some(value)) => *existing = Some(value.clone()),
            (Some(kept), Some(value)) if kept != value => {
                self.conflicts.push(AttributeConflict {
                    entity: self.entity,
                    key: self.key.to_string(),
                    field: name.to_string(),
                    kept: kept.to_string(),
                    ignored: value.to_string(),
                });
            }
            _ => {}
        }
    }

    fn finish(self) -> Vec<AttributeConflict> {
        self.conflicts
    }
}

/// 序列中的一个文件，以内容哈希标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesFile {
    pub series_instance_uid: String,
    pub content_hash: String,
}

/// 一个提交批次中待写入的实体
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkedBatch {
    pub patients: Vec<PatientRecord>,
    pub studies: Vec<StudyRecord>,
    pub series: Vec<SeriesRecord>,
    /// 自上次提交以来新关联的文件，序列切片数由此累计
    pub series_files: Vec<SeriesFile>,
}

impl LinkedBatch {
    pub fn is_empty(&self) -> bool {
        self.patients.is_empty() && self.studies.is_empty() && self.series.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patients.len() + self.studies.len() + self.series.len()
    }
}

/// 已提交数据的主键关联索引
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyIndex {
    /// StudyInstanceUID -> PatientID
    pub studies: HashMap<String, String>,
    /// SeriesInstanceUID -> StudyInstanceUID
    pub series: HashMap<String, String>,
}

/// 按实体统计的数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub patients: usize,
    pub studies: usize,
    pub series: usize,
}

impl EntityCounts {
    pub fn total(&self) -> usize {
        self.patients + self.studies + self.series
    }

    pub fn bump(&mut self, entity: EntityKind) {
        match entity {
            EntityKind::Patient => self.patients += 1,
            EntityKind::Study => self.studies += 1,
            EntityKind::Series => self.series += 1,
        }
    }

    pub fn add(&mut self, other: &EntityCounts) {
        self.patients += other.patients;
        self.studies += other.studies;
        self.series += other.series;
    }
}

/// 写入时被拒绝的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub entity: EntityKind,
    pub key: String,
    pub reason: String,
}

/// 批次提交结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitReport {
    pub inserted: EntityCounts,
    pub updated: EntityCounts,
    pub unchanged: EntityCounts,
    pub rejected: Vec<RejectedRecord>,
    pub conflicts: Vec<AttributeConflict>,
}

/// 单个文件或记录的错误事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestEvent {
    pub kind: ErrorKind,
    pub location: String,
    pub message: String,
}

/// 汇总统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_patients: u64,
    pub total_studies: u64,
    pub total_series: u64,
    pub total_slices: u64,
    pub avg_slices_per_study: f64,
    pub slice_thickness_min: Option<f64>,
    pub slice_thickness_max: Option<f64>,
    pub slice_thickness_mean: Option<f64>,
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Summary Statistics:")?;
        writeln!(f, "- Total Studies: {}", self.total_studies)?;
        writeln!(f, "- Total Slices: {}", self.total_slices)?;
        writeln!(f, "- Average Slices per Study: {:.2}", self.avg_slices_per_study)?;
        match (
            self.slice_thickness_min,
            self.slice_thickness_max,
            self.slice_thickness_mean,
        ) {
            (Some(min), Some(max), Some(mean)) => write!(
                f,
                "- Slice Thickness: Min = {:.2}, Max = {:.2}, Mean = {:.2}",
                min, max, mean
            ),
            _ => write!(f, "- Slice Thickness: No valid data available."),
        }
    }
}

/// 切片厚度直方图的一个区间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: u64,
}
