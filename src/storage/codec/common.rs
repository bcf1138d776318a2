use crate::error::{PlumeDBError, PlumeDBResult};
use crate::storage::codec::DecodedData;
use crate::storage::page::RecordId;

/// Big-endian scalar and length-prefixed byte-string codecs shared by the
/// page codecs.
pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u8(value: u8) -> Vec<u8> {
        vec![value]
    }

    pub fn decode_u8(bytes: &[u8]) -> PlumeDBResult<DecodedData<u8>> {
        if bytes.is_empty() {
            return Err(PlumeDBError::Internal(
                "cannot decode u8 from empty bytes".to_string(),
            ));
        }
        Ok((bytes[0], 1))
    }

    pub fn encode_u32(value: u32) -> Vec<u8> {
        value.to_be_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> PlumeDBResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(PlumeDBError::Internal(format!(
                "cannot decode u32 from {} bytes",
                bytes.len()
            )));
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[0..4]);
        Ok((u32::from_be_bytes(buf), 4))
    }

    pub fn encode_bytes(value: &[u8]) -> Vec<u8> {
        let mut bytes = Self::encode_u32(value.len() as u32);
        bytes.extend(value);
        bytes
    }

    pub fn decode_bytes(bytes: &[u8]) -> PlumeDBResult<DecodedData<Vec<u8>>> {
        let (len, offset) = Self::decode_u32(bytes)?;
        let len = len as usize;
        if bytes.len() < offset + len {
            return Err(PlumeDBError::Internal(format!(
                "cannot decode {} bytes from {} remaining",
                len,
                bytes.len() - offset
            )));
        }
        Ok((bytes[offset..offset + len].to_vec(), offset + len))
    }
}

pub struct RidCodec;

impl RidCodec {
    pub fn encode(rid: &RecordId) -> Vec<u8> {
        let mut bytes = CommonCodec::encode_u32(rid.page_id);
        bytes.extend(CommonCodec::encode_u32(rid.slot_num));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> PlumeDBResult<DecodedData<RecordId>> {
        let mut left_bytes = bytes;
        let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (slot_num, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        Ok((RecordId::new(page_id, slot_num), bytes.len() - left_bytes.len()))
    }
}
