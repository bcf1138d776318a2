use crate::buffer::PAGE_SIZE;
use crate::error::{PlumeDBError, PlumeDBResult};
use crate::storage::codec::{CommonCodec, DecodedData, RidCodec};
use crate::storage::index::comparator::KeyComparator;
use crate::storage::page::{
    BPlusTreeInternalPage, BPlusTreeInternalPageHeader, BPlusTreeLeafPage,
    BPlusTreeLeafPageHeader, BPlusTreePage, BPlusTreePageType,
};

pub struct BPlusTreePageCodec;

impl BPlusTreePageCodec {
    pub fn encode(page: &BPlusTreePage) -> Vec<u8> {
        match page {
            BPlusTreePage::Leaf(page) => BPlusTreeLeafPageCodec::encode(page),
            BPlusTreePage::Internal(page) => BPlusTreeInternalPageCodec::encode(page),
        }
    }

    pub fn decode(
        bytes: &[u8],
        comparator: KeyComparator,
    ) -> PlumeDBResult<DecodedData<BPlusTreePage>> {
        let (page_type, _) = BPlusTreePageTypeCodec::decode(bytes)?;
        match page_type {
            BPlusTreePageType::LeafPage => {
                let (page, offset) = BPlusTreeLeafPageCodec::decode(bytes, comparator)?;
                Ok((BPlusTreePage::Leaf(page), offset))
            }
            BPlusTreePageType::InternalPage => {
                let (page, offset) = BPlusTreeInternalPageCodec::decode(bytes, comparator)?;
                Ok((BPlusTreePage::Internal(page), offset))
            }
        }
    }
}

pub struct BPlusTreeLeafPageCodec;

impl BPlusTreeLeafPageCodec {
    pub fn encode(page: &BPlusTreeLeafPage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend(BPlusTreePageTypeCodec::encode(&page.header.page_type));
        bytes.extend(CommonCodec::encode_u32(page.header.current_size));
        bytes.extend(CommonCodec::encode_u32(page.header.max_size));
        bytes.extend(CommonCodec::encode_u32(page.header.next_page_id));
        for (key, rid) in page.array.iter() {
            bytes.extend(CommonCodec::encode_bytes(key));
            bytes.extend(RidCodec::encode(rid));
        }
        assert!(bytes.len() <= PAGE_SIZE, "leaf page overflows page size");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(
        bytes: &[u8],
        comparator: KeyComparator,
    ) -> PlumeDBResult<DecodedData<BPlusTreeLeafPage>> {
        let mut left_bytes = bytes;

        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        if page_type != BPlusTreePageType::LeafPage {
            return Err(PlumeDBError::Internal(
                "page type must be leaf page".to_string(),
            ));
        }
        left_bytes = &left_bytes[offset..];

        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (next_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let mut array = Vec::with_capacity(current_size as usize);
        for _ in 0..current_size {
            let (key, offset) = CommonCodec::decode_bytes(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (rid, offset) = RidCodec::decode(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            array.push((key, rid));
        }

        Ok((
            BPlusTreeLeafPage {
                header: BPlusTreeLeafPageHeader {
                    page_type,
                    current_size,
                    max_size,
                    next_page_id,
                },
                array,
                comparator,
            },
            PAGE_SIZE,
        ))
    }
}

pub struct BPlusTreeInternalPageCodec;

impl BPlusTreeInternalPageCodec {
    pub fn encode(page: &BPlusTreeInternalPage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend(BPlusTreePageTypeCodec::encode(&page.header.page_type));
        bytes.extend(CommonCodec::encode_u32(page.header.current_size));
        bytes.extend(CommonCodec::encode_u32(page.header.max_size));
        for (key, page_id) in page.array.iter() {
            bytes.extend(CommonCodec::encode_bytes(key));
            bytes.extend(CommonCodec::encode_u32(*page_id));
        }
        assert!(bytes.len() <= PAGE_SIZE, "internal page overflows page size");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(
        bytes: &[u8],
        comparator: KeyComparator,
    ) -> PlumeDBResult<DecodedData<BPlusTreeInternalPage>> {
        let mut left_bytes = bytes;

        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        if page_type != BPlusTreePageType::InternalPage {
            return Err(PlumeDBError::Internal(
                "page type must be internal page".to_string(),
            ));
        }
        left_bytes = &left_bytes[offset..];

        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let mut array = Vec::with_capacity(current_size as usize);
        for _ in 0..current_size {
            let (key, offset) = CommonCodec::decode_bytes(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            array.push((key, page_id));
        }

        Ok((
            BPlusTreeInternalPage {
                header: BPlusTreeInternalPageHeader {
                    page_type,
                    current_size,
                    max_size,
                },
                array,
                comparator,
            },
            PAGE_SIZE,
        ))
    }
}

pub struct BPlusTreePageTypeCodec;

impl BPlusTreePageTypeCodec {
    pub fn encode(page_type: &BPlusTreePageType) -> Vec<u8> {
        match page_type {
            BPlusTreePageType::LeafPage => CommonCodec::encode_u8(1),
            BPlusTreePageType::InternalPage => CommonCodec::encode_u8(2),
        }
    }

    pub fn decode(bytes: &[u8]) -> PlumeDBResult<DecodedData<BPlusTreePageType>> {
        let (flag, offset) = CommonCodec::decode_u8(bytes)?;
        match flag {
            1 => Ok((BPlusTreePageType::LeafPage, offset)),
            2 => Ok((BPlusTreePageType::InternalPage, offset)),
            _ => Err(PlumeDBError::Internal(format!(
                "invalid page type {}",
                flag
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::index::comparator::default_comparator;
    use crate::storage::page::RecordId;

    #[test]
    fn node_pages_survive_encode_decode() {
        let mut leaf = BPlusTreeLeafPage::new(10);
        leaf.insert(1u32.to_be_bytes().to_vec(), RecordId::new(1, 1));
        leaf.insert(2u32.to_be_bytes().to_vec(), RecordId::new(2, 2));
        leaf.header.next_page_id = 17;

        let encoded = BPlusTreeLeafPageCodec::encode(&leaf);
        assert_eq!(encoded.len(), PAGE_SIZE);
        let (decoded, _) = BPlusTreeLeafPageCodec::decode(&encoded, default_comparator).unwrap();
        assert_eq!(decoded.header.current_size, 2);
        assert_eq!(decoded.header.next_page_id, 17);
        assert_eq!(decoded.look_up(&2u32.to_be_bytes()), Some(RecordId::new(2, 2)));

        let mut internal = BPlusTreeInternalPage::new(10);
        internal.insert(Vec::new(), 3);
        internal.insert(5u32.to_be_bytes().to_vec(), 4);

        let encoded = BPlusTreeInternalPageCodec::encode(&internal);
        let (decoded, _) = BPlusTreePageCodec::decode(&encoded, default_comparator).unwrap();
        match decoded {
            BPlusTreePage::Internal(page) => {
                assert_eq!(page.header.current_size, 2);
                assert_eq!(page.value_at(0), 3);
                assert_eq!(page.look_up(&9u32.to_be_bytes()), 4);
            }
            BPlusTreePage::Leaf(_) => panic!("decoded the wrong page type"),
        }
    }
}
