//! 通用工具函数

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// 生成唯一的DICOM标识符（UUID派生的 2.25 根）
pub fn generate_dicom_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= 64
        && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !uid.starts_with('.')
        && !uid.ends_with('.')
        && !uid.contains("..")
}

/// 计算内容的SHA-256哈希值（十六进制）
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// 将标识符转换为安全的路径片段
///
/// `[A-Za-z0-9._-]` 以外的字符替换为 `_`，`.`、`..` 和空串整体替换为 `_`。
pub fn sanitize_path_component(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_dicom_uid() {
        let uid = generate_dicom_uid();
        assert!(is_valid_dicom_uid(&uid));
        assert_ne!(uid, generate_dicom_uid());
    }

    #[test]
    fn test_is_valid_dicom_uid() {
        assert!(is_valid_dicom_uid("1.2.840.10008.5.1.4.1.1.4"));
        assert!(!is_valid_dicom_uid(""));
        assert!(!is_valid_dicom_uid("invalid.uid.with.letters"));
        assert!(!is_valid_dicom_uid("1..2"));
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("LIDC-IDRI-0001"), "LIDC-IDRI-0001");
        assert_eq!(sanitize_path_component("1.3.6.1.4.1.14519"), "1.3.6.1.4.1.14519");
        assert_eq!(sanitize_path_component("../etc"), ".._etc");
        assert_eq!(sanitize_path_component(".."), "_");
        assert_eq!(sanitize_path_component("Doe^John"), "Doe_John");
        assert_eq!(sanitize_path_component("  "), "_");
    }
}
