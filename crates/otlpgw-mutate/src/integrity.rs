//! 重组后的完整性修复钩子。

use serde::Deserialize;
use thiserror::Error;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum IntegrityError {
    #[error("CRC32 trailer requires at least 4 bytes, payload has {length}")]
    PayloadTooShort { length: usize },
}

impl IntegrityError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PayloadTooShort { .. } => "integrity.payload_too_short",
        }
    }
}

/// 在所有结构性修改完成后修复载荷的完整性元数据（例如尾部校验和）。
///
/// `payload` 恰好是最终载荷，实现不得改变其长度。
pub trait IntegrityRepair: Send + Sync {
    fn repair(&self, payload: &mut [u8]) -> Result<(), IntegrityError>;
}

/// 默认实现：什么都不做。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopIntegrityRepair;

impl IntegrityRepair for NoopIntegrityRepair {
    fn repair(&self, _payload: &mut [u8]) -> Result<(), IntegrityError> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// 对除末尾 4 字节之外的全部字节计算 CRC32，并写回末尾 4 字节。
#[derive(Clone, Copy, Debug, Default)]
pub struct Crc32TailIntegrityRepair {
    endianness: Endianness,
}

impl Crc32TailIntegrityRepair {
    pub fn new(endianness: Endianness) -> Self {
        Self { endianness }
    }
}

impl IntegrityRepair for Crc32TailIntegrityRepair {
    fn repair(&self, payload: &mut [u8]) -> Result<(), IntegrityError> {
        let Some(checksum_at) = payload.len().checked_sub(4) else {
            return Err(IntegrityError::PayloadTooShort {
                length: payload.len(),
            });
        };
        let checksum = crc32fast::hash(&payload[..checksum_at]);
        let bytes = match self.endianness {
            Endianness::Little => checksum.to_le_bytes(),
            Endianness::Big => checksum.to_be_bytes(),
        };
        payload[checksum_at..].copy_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_trailer_respects_endianness() {
        let expected = crc32fast::hash(&[1, 2, 3, 4]);

        let mut little = [1u8, 2, 3, 4, 0, 0, 0, 0];
        Crc32TailIntegrityRepair::new(Endianness::Little)
            .repair(&mut little)
            .expect("long enough");
        assert_eq!(&little[4..], &expected.to_le_bytes());

        let mut big = [1u8, 2, 3, 4, 0, 0, 0, 0];
        Crc32TailIntegrityRepair::new(Endianness::Big)
            .repair(&mut big)
            .expect("long enough");
        assert_eq!(&big[4..], &expected.to_be_bytes());
    }

    #[test]
    fn short_payload_is_rejected() {
        let mut tiny = [0u8; 3];
        let err = Crc32TailIntegrityRepair::default()
            .repair(&mut tiny)
            .unwrap_err();
        assert_eq!(err, IntegrityError::PayloadTooShort { length: 3 });
        assert!(NoopIntegrityRepair.repair(&mut tiny).is_ok());
    }
}
