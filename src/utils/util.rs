use crate::buffer::PAGE_SIZE;

/// Copy an encoded page image into the fixed-size array a frame expects.
/// Codecs always pad their output to `PAGE_SIZE`.
pub fn page_bytes_to_array(bytes: &[u8]) -> [u8; PAGE_SIZE] {
    debug_assert_eq!(bytes.len(), PAGE_SIZE);
    let mut data = [0u8; PAGE_SIZE];
    data.copy_from_slice(&bytes[..PAGE_SIZE]);
    data
}
