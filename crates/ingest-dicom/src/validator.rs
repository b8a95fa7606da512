//! DICOM文件有效性判定
//!
//! 只读取判定所需的字节范围：先取 `probe_bytes` 字节，文件头不完整时按倍数扩大读取范围，
//! 解析在像素数据标签处停止，因此不会为了验证而读取像素数据。

use crate::schema::HeaderReader;
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, InMemDicomObject, OpenFileOptions};
use dicom_ingest_core::{FileCandidate, ObjectSource};
use thiserror::Error;
use tracing::{debug, warn};

/// 前导字节长度
pub const PREAMBLE_LEN: usize = 128;
/// 前导之后的DICOM标识
pub const DICM_MAGIC: &[u8; 4] = b"DICM";
/// (7FE0,0010) 像素数据标签的小端字节序
const PIXEL_DATA_TAG_LE: [u8; 4] = [0xE0, 0x7F, 0x10, 0x00];

/// 已解析的文件头（不含像素数据）
#[derive(Debug, Clone)]
pub struct DicomHeader {
    object: DefaultDicomObject,
    probed_bytes: usize,
}

impl DicomHeader {
    #[cfg(test)]
    pub(crate) fn from_object(object: DefaultDicomObject) -> Self {
        Self {
            object,
            probed_bytes: 0,
        }
    }

    pub fn object(&self) -> &InMemDicomObject {
        &self.object
    }

    pub fn reader(&self) -> HeaderReader<'_> {
        HeaderReader::new(self.object())
    }

    /// 判定时实际读取的字节数
    pub fn probed_bytes(&self) -> usize {
        self.probed_bytes
    }

    /// 文件元信息中的传输语法UID
    pub fn transfer_syntax(&self) -> &str {
        self.object.meta().transfer_syntax()
    }
}

/// 无效原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    #[error("文件过短，缺少128字节前导和DICM标识")]
    TooShort,

    #[error("缺少DICM标识")]
    MissingMagic,

    #[error("文件头被截断或格式错误: {0}")]
    Truncated(String),

    #[error("缺少必需字段 {0}")]
    MissingField(&'static str),
}

/// 验证结果
#[derive(Debug)]
pub enum ValidationResult {
    Valid(DicomHeader),
    Invalid(InvalidReason),
    Unreadable(String),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid(_))
    }
}

/// 单次探测的结论
#[derive(Debug)]
enum Probe {
    Complete(DicomHeader),
    /// 读取更多字节可能改变结论
    Incomplete(InvalidReason),
    /// 结论不会随读取范围改变
    Rejected(InvalidReason),
}

/// DICOM文件验证器
#[derive(Debug, Clone)]
pub struct DicomValidator {
    probe_bytes: usize,
}

impl Default for DicomValidator {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl DicomValidator {
    /// 创建验证器，`probe_bytes` 为首次读取的字节数
    pub fn new(probe_bytes: usize) -> Self {
        Self {
            probe_bytes: probe_bytes.max(PREAMBLE_LEN + DICM_MAGIC.len()),
        }
    }

    /// 判定候选文件是否为有效的DICOM对象
    pub async fn validate(
        &self,
        source: &dyn ObjectSource,
        candidate: &FileCandidate,
    ) -> ValidationResult {
        let size = candidate.size_bytes;
        if size < (PREAMBLE_LEN + DICM_MAGIC.len()) as u64 {
            return ValidationResult::Invalid(InvalidReason::TooShort);
        }

        let mut want = (self.probe_bytes as u64).min(size);
        loop {
            let bytes = match source.fetch(&candidate.location, 0..want).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Cannot read {}: {}", candidate.location, e);
                    return ValidationResult::Unreadable(e.to_string());
                }
            };
            let exhausted = want >= size || (bytes.len() as u64) < want;

            match inspect(&bytes) {
                Probe::Complete(header) => {
                    debug!(
                        "Validated {} after reading {} of {} bytes",
                        candidate.location,
                        header.probed_bytes(),
                        size
                    );
                    return ValidationResult::Valid(header);
                }
                Probe::Rejected(reason) => return ValidationResult::Invalid(reason),
                Probe::Incomplete(reason) if exhausted => {
                    return ValidationResult::Invalid(reason)
                }
                Probe::Incomplete(reason) => {
                    debug!(
                        "Header of {} incomplete after {} bytes ({}), widening probe",
                        candidate.location, want, reason
                    );
                    want = want.saturating_mul(2).min(size);
                }
            }
        }
    }

    /// 对内存中的完整文件内容进行判定
    pub fn validate_bytes(&self, bytes: &[u8]) -> ValidationResult {
        match inspect(bytes) {
            Probe::Complete(header) => ValidationResult::Valid(header),
            Probe::Incomplete(reason) | Probe::Rejected(reason) => {
                ValidationResult::Invalid(reason)
            }
        }
    }
}

fn inspect(bytes: &[u8]) -> Probe {
    if bytes.len() < PREAMBLE_LEN + DICM_MAGIC.len() {
        return Probe::Incomplete(InvalidReason::TooShort);
    }
    if &bytes[PREAMBLE_LEN..PREAMBLE_LEN + DICM_MAGIC.len()] != DICM_MAGIC {
        return Probe::Rejected(InvalidReason::MissingMagic);
    }

    let object = match OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .from_reader(&bytes[PREAMBLE_LEN..])
    {
        Ok(object) => object,
        Err(e) => return Probe::Incomplete(InvalidReason::Truncated(e.to_string())),
    };

    let missing = HeaderReader::new(&object)
        .first_missing_mandatory()
        .map(|spec| spec.name);
    match missing {
        Some(name) if reached_pixel_data(bytes) => {
            Probe::Rejected(InvalidReason::MissingField(name))
        }
        Some(name) => Probe::Incomplete(InvalidReason::MissingField(name)),
        None => Probe::Complete(DicomHeader {
            object,
            probed_bytes: bytes.len(),
        }),
    }
}

/// 探测范围内已经出现像素数据标签，说明文件头已完整读取
fn reached_pixel_data(bytes: &[u8]) -> bool {
    bytes[PREAMBLE_LEN..]
        .windows(PIXEL_DATA_TAG_LE.len())
        .any(|window| window == PIXEL_DATA_TAG_LE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::SyntheticInstance;
    use async_trait::async_trait;
    use bytes::Bytes;
    use dicom_ingest_core::{IngestError, Result, SourceKind};
    use futures::stream::{self, BoxStream, StreamExt};
    use std::ops::Range;
    use std::sync::Mutex;

    /// 记录每次读取范围的内存数据源
    struct RecordingSource {
        data: Bytes,
        fail: bool,
        fetched: Mutex<Vec<Range<u64>>>,
    }

    impl RecordingSource {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data: Bytes::from(data),
                fail: false,
                fetched: Mutex::new(Vec::new()),
            }
        }

        fn candidate(&self) -> FileCandidate {
            FileCandidate {
                location: "mem/1-001.dcm".to_string(),
                size_bytes: self.data.len() as u64,
                source_kind: SourceKind::Remote,
            }
        }

        fn max_fetched(&self) -> u64 {
            self.fetched.lock().unwrap().iter().map(|r| r.end).max().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ObjectSource for RecordingSource {
        fn kind(&self) -> SourceKind {
            SourceKind::Remote
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }

        async fn locate(&self) -> Result<BoxStream<'_, Result<FileCandidate>>> {
            Ok(stream::iter(vec![Ok(self.candidate())]).boxed())
        }

        async fn fetch(&self, location: &str, range: Range<u64>) -> Result<Bytes> {
            if self.fail {
                return Err(IngestError::Unreadable {
                    location: location.to_string(),
                    reason: "permission denied".to_string(),
                });
            }
            self.fetched.lock().unwrap().push(range.clone());
            let end = (range.end as usize).min(self.data.len());
            Ok(self.data.slice(range.start as usize..end))
        }

        async fn remove(&self, _location: &str) -> Result<()> {
            Ok(())
        }
    }

    fn instance() -> SyntheticInstance {
        SyntheticInstance::new("LIDC-IDRI-0001", "1.2.826.0.1.1", "1.2.826.0.1.1.1")
    }

    #[tokio::test]
    async fn test_valid_file_without_reading_pixel_data() {
        let data = instance().with_pixel_data(512 * 1024).to_bytes().unwrap();
        let source = RecordingSource::new(data);
        let validator = DicomValidator::new(4096);

        let result = validator.validate(&source, &source.candidate()).await;
        assert!(result.is_valid(), "{:?}", result);
        assert!(source.max_fetched() <= 4096);
    }

    #[tokio::test]
    async fn test_probe_widens_until_header_complete() {
        let data = instance()
            .with_study_description(&"X".repeat(3000))
            .with_pixel_data(64 * 1024)
            .to_bytes()
            .unwrap();
        let source = RecordingSource::new(data);
        let validator = DicomValidator::new(256);

        let result = validator.validate(&source, &source.candidate()).await;
        assert!(result.is_valid(), "{:?}", result);
        assert!(source.fetched.lock().unwrap().len() > 1);
        assert!(source.max_fetched() < 64 * 1024);
    }

    #[tokio::test]
    async fn test_wrong_magic_is_invalid() {
        let mut data = instance().to_bytes().unwrap();
        data[PREAMBLE_LEN..PREAMBLE_LEN + 4].copy_from_slice(b"NOPE");
        let source = RecordingSource::new(data);

        let result = DicomValidator::default()
            .validate(&source, &source.candidate())
            .await;
        assert!(matches!(
            result,
            ValidationResult::Invalid(InvalidReason::MissingMagic)
        ));
    }

    #[tokio::test]
    async fn test_missing_mandatory_field_is_invalid() {
        let data = instance().without_series_uid().to_bytes().unwrap();
        let source = RecordingSource::new(data);

        let result = DicomValidator::default()
            .validate(&source, &source.candidate())
            .await;
        assert!(matches!(
            result,
            ValidationResult::Invalid(InvalidReason::MissingField("SeriesInstanceUID"))
        ));
    }

    #[tokio::test]
    async fn test_empty_patient_id_is_invalid() {
        let data = SyntheticInstance::new("", "1.2.3", "1.2.3.4").to_bytes().unwrap();
        let source = RecordingSource::new(data);

        let result = DicomValidator::default()
            .validate(&source, &source.candidate())
            .await;
        assert!(matches!(
            result,
            ValidationResult::Invalid(InvalidReason::MissingField("PatientID"))
        ));
    }

    #[tokio::test]
    async fn test_truncated_and_tiny_files_are_invalid() {
        let data = instance().to_bytes().unwrap();
        let source = RecordingSource::new(data[..PREAMBLE_LEN + 40].to_vec());
        let result = DicomValidator::default()
            .validate(&source, &source.candidate())
            .await;
        assert!(matches!(result, ValidationResult::Invalid(_)), "{:?}", result);

        let source = RecordingSource::new(vec![0u8; 20]);
        let result = DicomValidator::default()
            .validate(&source, &source.candidate())
            .await;
        assert!(matches!(
            result,
            ValidationResult::Invalid(InvalidReason::TooShort)
        ));
    }

    #[tokio::test]
    async fn test_io_failure_is_unreadable() {
        let mut source = RecordingSource::new(instance().to_bytes().unwrap());
        source.fail = true;

        let result = DicomValidator::default()
            .validate(&source, &source.candidate())
            .await;
        assert!(matches!(result, ValidationResult::Unreadable(_)));
    }

    #[test]
    fn test_validate_bytes() {
        let validator = DicomValidator::default();
        let data = instance().with_slice_thickness("2.5").to_bytes().unwrap();
        match validator.validate_bytes(&data) {
            ValidationResult::Valid(header) => {
                assert_eq!(header.probed_bytes(), data.len());
                assert!(header.transfer_syntax().starts_with("1.2.840.10008.1.2.1"));
            }
            other => panic!("expected valid header, got {:?}", other),
        }
        assert!(!validator.validate_bytes(b"not a dicom file").is_valid());
    }
}
