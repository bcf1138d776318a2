use crate::buffer::PAGE_SIZE;
use crate::error::{PlumeDBError, PlumeDBResult};
use crate::storage::codec::{CommonCodec, DecodedData};
use crate::storage::page::BPlusTreeHeaderPage;

pub struct BPlusTreeHeaderPageCodec;

impl BPlusTreeHeaderPageCodec {
    pub fn encode(page: &BPlusTreeHeaderPage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend(CommonCodec::encode_u32(page.records.len() as u32));
        for (name, root_page_id) in page.records.iter() {
            bytes.extend(CommonCodec::encode_bytes(name.as_bytes()));
            bytes.extend(CommonCodec::encode_u32(*root_page_id));
        }
        assert!(bytes.len() <= PAGE_SIZE, "header page overflows page size");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> PlumeDBResult<DecodedData<BPlusTreeHeaderPage>> {
        let mut left_bytes = bytes;

        let (count, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (name_bytes, offset) = CommonCodec::decode_bytes(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (root_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let name = String::from_utf8(name_bytes)
                .map_err(|e| PlumeDBError::Internal(format!("invalid index name: {}", e)))?;
            records.push((name, root_page_id));
        }

        Ok((BPlusTreeHeaderPage { records }, PAGE_SIZE))
    }
}
