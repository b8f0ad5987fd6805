//! CRC-32 checksums appended to records, meta blobs, and state roots.
//! The trailing four bytes of a protected region hold the checksum of
//! everything before them.

use eyre::Result;

use crate::errors::corrupt;

pub const LEN: usize = 4;

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

pub fn sum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Computes the checksum of `buf` minus its last four bytes and stores it
/// there. `buf` must already include the checksum slot.
pub fn update(buf: &mut [u8]) {
    debug_assert!(buf.len() >= LEN);
    let at = buf.len() - LEN;
    let s = sum(&buf[..at]);
    buf[at..].copy_from_slice(&s.to_le_bytes());
}

/// Verifies a region whose last four bytes are its checksum.
pub fn check(buf: &[u8]) -> Result<()> {
    if buf.len() < LEN {
        return Err(corrupt("region too short for checksum"));
    }
    let at = buf.len() - LEN;
    let want = u32::from_le_bytes(buf[at..].try_into().unwrap());
    let got = sum(&buf[..at]);
    if got != want {
        return Err(corrupt(format!(
            "checksum mismatch: computed {:#010x}, stored {:#010x}",
            got, want
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_then_check() {
        let mut buf = vec![1, 2, 3, 4, 5, 0, 0, 0, 0];
        update(&mut buf);
        assert!(check(&buf).is_ok());
        buf[2] ^= 1;
        assert!(check(&buf).is_err());
    }
}
