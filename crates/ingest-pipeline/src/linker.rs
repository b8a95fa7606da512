//! 记录关联
//!
//! 关联器独占本次运行的内存实体图。每条提取记录依次经过：
//! 1. 检查主键归属：检查只能属于一个患者，序列只能属于一个检查（包括已提交的数据）
//! 2. 按“先写入者优先”合并患者、检查、序列属性
//! 3. 按内容哈希去重，新出现的文件随批次交给存储层累计切片数
//!
//! 归属检查在任何修改之前完成，被拒绝的记录不会留下部分写入。

use dicom_ingest_core::{
    AttributeConflict, EntityKind, ExtractedRecord, KeyIndex, LinkError, LinkedBatch,
    PatientRecord, SeriesFile, SeriesRecord, StudyRecord,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// 单条记录的关联结果
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOutcome {
    pub patient_id: String,
    pub study_uid: String,
    pub series_uid: String,
    /// 文件内容首次出现在该序列中，计入切片数
    pub counted: bool,
    /// 合并时被忽略的属性值
    pub conflicts: Vec<AttributeConflict>,
}

#[derive(Debug)]
struct StagedSeries {
    record: SeriesRecord,
    file_hashes: HashSet<String>,
    /// 尚未随批次提交的哈希
    unsaved: Vec<String>,
}

/// 记录关联器
#[derive(Debug, Default)]
pub struct RecordLinker {
    /// 已提交数据的主键归属
    known: KeyIndex,
    patients: HashMap<String, PatientRecord>,
    studies: HashMap<String, StudyRecord>,
    series: HashMap<String, StagedSeries>,
    dirty_patients: BTreeSet<String>,
    dirty_studies: BTreeSet<String>,
    dirty_series: BTreeSet<String>,
}

impl RecordLinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以已提交数据的主键归属初始化
    pub fn seeded(known: KeyIndex) -> Self {
        Self {
            known,
            ..Self::default()
        }
    }

    /// 只检查归属，不修改实体图
    pub fn check(&self, record: &ExtractedRecord) -> Result<(), LinkError> {
        let patient_id = &record.patient.patient_id;
        let study_uid = &record.study.study_instance_uid;
        let series_uid = &record.series.series_instance_uid;

        if &record.study.patient_id != patient_id {
            return Err(LinkError::MissingParent {
                entity: EntityKind::Study,
                key: study_uid.clone(),
                parent: record.study.patient_id.clone(),
            });
        }
        if &record.series.study_instance_uid != study_uid {
            return Err(LinkError::MissingParent {
                entity: EntityKind::Series,
                key: series_uid.clone(),
                parent: record.series.study_instance_uid.clone(),
            });
        }

        if let Some(existing) = self.study_owner(study_uid) {
            if existing != patient_id {
                return Err(LinkError::CrossPatientStudy {
                    study_uid: study_uid.clone(),
                    existing_patient: existing.to_string(),
                    claimed_patient: patient_id.clone(),
                });
            }
        }
        if let Some(existing) = self.series_owner(series_uid) {
            if existing != study_uid {
                return Err(LinkError::CrossStudySeries {
                    series_uid: series_uid.clone(),
                    existing_study: existing.to_string(),
                    claimed_study: study_uid.clone(),
                });
            }
        }
        Ok(())
    }

    /// 关联一条记录
    ///
    /// `content_hash` 相同的文件在同一序列中只计一次。
    pub fn link(
        &mut self,
        record: ExtractedRecord,
        content_hash: &str,
    ) -> Result<LinkOutcome, LinkError> {
        self.check(&record)?;

        let ExtractedRecord {
            patient,
            study,
            series,
            ..
        } = record;
        let patient_id = patient.patient_id.clone();
        let study_uid = study.study_instance_uid.clone();
        let series_uid = series.series_instance_uid.clone();
        let mut conflicts = Vec::new();

        // 1. 患者
        match self.patients.get_mut(&patient_id) {
            Some(existing) => conflicts.extend(existing.merge_from(&patient)),
            None => {
                self.patients.insert(patient_id.clone(), patient);
            }
        }
        self.dirty_patients.insert(patient_id.clone());

        // 2. 检查
        match self.studies.get_mut(&study_uid) {
            Some(existing) => conflicts.extend(existing.merge_from(&study)),
            None => {
                self.studies.insert(study_uid.clone(), study);
            }
        }
        self.dirty_studies.insert(study_uid.clone());

        // 3. 序列及派生切片数
        let staged = self
            .series
            .entry(series_uid.clone())
            .or_insert_with(|| StagedSeries {
                record: SeriesRecord::from_fragment(series.clone(), 0),
                file_hashes: HashSet::new(),
                unsaved: Vec::new(),
            });
        conflicts.extend(
            staged
                .record
                .merge_from(&SeriesRecord::from_fragment(series, 0)),
        );
        let counted = staged.file_hashes.insert(content_hash.to_string());
        if counted {
            staged.record.number_of_slices = staged.file_hashes.len() as u32;
            staged.unsaved.push(content_hash.to_string());
        } else {
            debug!(
                "Content {} already counted for series {}",
                content_hash, series_uid
            );
        }
        self.dirty_series.insert(series_uid.clone());

        for conflict in &conflicts {
            warn!("Attribute conflict: {}", conflict);
        }

        Ok(LinkOutcome {
            patient_id,
            study_uid,
            series_uid,
            counted,
            conflicts,
        })
    }

    /// 取出自上次提交以来变更过的实体
    pub fn take_batch(&mut self) -> LinkedBatch {
        let patients = std::mem::take(&mut self.dirty_patients)
            .into_iter()
            .filter_map(|id| self.patients.get(&id).cloned())
            .collect();
        let studies = std::mem::take(&mut self.dirty_studies)
            .into_iter()
            .filter_map(|uid| self.studies.get(&uid).cloned())
            .collect();
        let mut series = Vec::new();
        let mut series_files = Vec::new();
        for uid in std::mem::take(&mut self.dirty_series) {
            if let Some(staged) = self.series.get_mut(&uid) {
                series.push(staged.record.clone());
                series_files.extend(staged.unsaved.drain(..).map(|content_hash| SeriesFile {
                    series_instance_uid: uid.clone(),
                    content_hash,
                }));
            }
        }

        LinkedBatch {
            patients,
            studies,
            series,
            series_files,
        }
    }

    /// 待提交的实体数
    pub fn pending(&self) -> usize {
        self.dirty_patients.len() + self.dirty_studies.len() + self.dirty_series.len()
    }

    /// 序列当前的切片数
    pub fn slice_count(&self, series_uid: &str) -> Option<u32> {
        self.series
            .get(series_uid)
            .map(|staged| staged.record.number_of_slices)
    }

    fn study_owner(&self, study_uid: &str) -> Option<&str> {
        self.studies
            .get(study_uid)
            .map(|study| study.patient_id.as_str())
            .or_else(|| self.known.studies.get(study_uid).map(String::as_str))
    }

    fn series_owner(&self, series_uid: &str) -> Option<&str> {
        self.series
            .get(series_uid)
            .map(|staged| staged.record.study_instance_uid.as_str())
            .or_else(|| self.known.series.get(series_uid).map(String::as_str))
    }
}
