use block_hash_common::{BlockHashError, BlockHashResult};

pub(crate) fn get_u8_le(bytes: &[u8]) -> BlockHashResult<(u8, &[u8])> {
    if bytes.is_empty() {
        return Err(BlockHashError::Decode("Invalid bytes".into()));
    }
    Ok((bytes[0], &bytes[1..]))
}

pub(crate) fn get_u32_le(bytes: &[u8]) -> BlockHashResult<(u32, &[u8])> {
    if bytes.len() < 4 {
        return Err(BlockHashError::Decode("Invalid bytes".into()));
    }
    let ans = u32::from_le_bytes(bytes[..4].try_into().unwrap());
    Ok((ans, &bytes[4..]))
}

pub(crate) fn get_u64_le(bytes: &[u8]) -> BlockHashResult<(u64, &[u8])> {
    if bytes.len() < 8 {
        return Err(BlockHashError::Decode("Invalid bytes".into()));
    }
    let ans = u64::from_le_bytes(bytes[..8].try_into().unwrap());
    Ok((ans, &bytes[8..]))
}

pub(crate) fn get_slice(bytes: &[u8], len: usize) -> BlockHashResult<(&[u8], &[u8])> {
    if bytes.len() < len {
        return Err(BlockHashError::Decode("Invalid bytes".into()));
    }
    Ok(bytes.split_at(len))
}

/// Split off and verify the trailing xxh32 checksum.
pub(crate) fn verify_checksum(bytes: &[u8], seed: u32) -> BlockHashResult<&[u8]> {
    if bytes.len() < 4 {
        return Err(BlockHashError::Decode("Invalid bytes".into()));
    }
    let (body, checksum) = bytes.split_at(bytes.len() - 4);
    let checksum = u32::from_le_bytes(checksum.try_into().unwrap());
    if checksum != xxhash_rust::xxh32::xxh32(body, seed) {
        return Err(BlockHashError::ChecksumMismatch);
    }
    Ok(body)
}
