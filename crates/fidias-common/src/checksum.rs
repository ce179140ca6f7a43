//! Fast checksums used outside content addressing
//!
//! CRC32C guards frames on the wire; xxHash64 spreads keys over lock
//! stripes and queue shards.

/// CRC32C of a buffer
#[must_use]
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// CRC32C continued over a second buffer
#[must_use]
pub fn crc32c_append(crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, data)
}

/// Stripe index of `key` among `stripes` slots
#[must_use]
pub fn stripe(key: &[u8], stripes: usize) -> usize {
    if stripes == 0 {
        return 0;
    }
    let h = xxhash_rust::xxh64::xxh64(key, 0);
    usize::try_from(h % stripes as u64).unwrap_or(0)
}
