mod common;
mod header_page;
mod index_page;

pub use common::{CommonCodec, RidCodec};
pub use header_page::BPlusTreeHeaderPageCodec;
pub use index_page::{
    BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec,
    BPlusTreePageTypeCodec,
};

/// Decoded value plus the number of bytes consumed.
pub type DecodedData<T> = (T, usize);
