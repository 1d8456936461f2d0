//! CRC-32 and additive checksum shared by the command buffer, the frame
//! reader and firmware transfers.

/// Reflected CRC-32 polynomial used by the DSP firmware.
pub const CRC32_POLYNOMIAL: u32 = 0xEDB8_8320;

// ============================================================================
// CRC-32 Table
// ============================================================================

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32_POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Byte-indexed lookup table, built at compile time.
pub static CRC_TABLE: [u32; 256] = build_crc_table();

/// Feed `data` into a running CRC.
///
/// No pre- or post-inversion: the firmware seeds with 0 and uses the
/// register value as-is.
pub fn crc32_update(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        crc = (crc >> 8) ^ CRC_TABLE[((crc ^ byte as u32) & 0xFF) as usize];
    }
    crc
}

/// CRC-32 of `data`, seeded at 0.
pub fn crc32(data: &[u8]) -> u32 {
    crc32_update(0, data)
}

// ============================================================================
// Additive Checksum
// ============================================================================

/// Wrapping 32-bit sum of little-endian words.
///
/// Trailing bytes that don't fill a word are ignored; the transport only
/// moves whole words.
pub fn additive_checksum(data: &[u8]) -> u32 {
    data.chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .fold(0u32, |sum, word| sum.wrapping_add(word))
}

/// Check a region whose last word is the additive checksum of the rest.
///
/// Returns `(expected, actual)` on mismatch.
pub fn verify_trailing_checksum(region: &[u8]) -> Result<(), (u32, u32)> {
    if region.len() < 4 {
        return Err((0, 0));
    }
    let (payload, check) = region.split_at(region.len() - 4);
    let expected = u32::from_le_bytes([check[0], check[1], check[2], check[3]]);
    let actual = additive_checksum(payload);
    if expected == actual {
        Ok(())
    } else {
        Err((expected, actual))
    }
}
