//! DFU file format: the mandatory 16-byte suffix (USB DFU 1.1 spec §7,
//! `suffix.c`) and the optional TI Stellaris prefix (`dfu_file.h`).
//!
//! Grounded on the teacher's `dfu_file.rs` (`SuffixInfo`, `compute_crc`,
//! `parse`), generalized from its Bose-specific vendor/product matching to
//! the general-purpose suffix dfu-util itself reads and writes.

use byteorder::{ByteOrder, LE};
use crc32fast::Hasher;

use crate::error::Error;

const SUFFIX_LEN: usize = 16;
const SUFFIX_SIGNATURE: [u8; 3] = *b"UFD"; // on-disk order; spec calls it "DFU" reversed
const STELLARIS_PREFIX_LEN: usize = 16;
const STELLARIS_MAGIC: [u8; 2] = [0x01, 0x00];

/// A suffix field that's either a specific value or "don't care"
/// (`0xFFFF`), matching how dfu-util treats `0xffff` in `idVendor`/
/// `idProduct`/`bcdDevice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionalId {
    Any,
    Id(u16),
}

impl OptionalId {
    fn from_raw(raw: u16) -> Self {
        if raw == 0xffff {
            OptionalId::Any
        } else {
            OptionalId::Id(raw)
        }
    }

    fn to_raw(self) -> u16 {
        match self {
            OptionalId::Any => 0xffff,
            OptionalId::Id(id) => id,
        }
    }

    pub fn matches(self, actual: u16) -> bool {
        match self {
            OptionalId::Any => true,
            OptionalId::Id(id) => id == actual,
        }
    }
}

/// Decoded 16-byte DFU suffix.
#[derive(Debug, Clone, Copy)]
pub struct SuffixInfo {
    pub bcd_device: OptionalId,
    pub id_product: OptionalId,
    pub id_vendor: OptionalId,
    pub bcd_dfu: u16,
    pub crc: u32,
}

/// Compute the suffix CRC over `data` (every byte of the file up to but
/// excluding the final `dwCRC32` field).
///
/// `crc32fast` implements the standard complemented CRC-32 (final XOR with
/// `0xFFFFFFFF`); the DFU suffix format stores the uncomplemented value, so
/// the streaming result is inverted once more before use.
pub fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    !hasher.finalize()
}

/// Strip and validate the trailing suffix, returning `(firmware payload,
/// suffix)`. Per spec §7, the CRC covers everything preceding the 4-byte
/// `dwCRC32` field, i.e. the payload plus the first 12 suffix bytes.
pub fn parse_suffix(file: &[u8]) -> Result<(&[u8], SuffixInfo), Error> {
    if file.len() < SUFFIX_LEN {
        return Err(Error::FileFormatError(format!(
            "file is only {} bytes, too short for a DFU suffix",
            file.len()
        )));
    }

    let suffix = &file[file.len() - SUFFIX_LEN..];
    let b_length = suffix[11];
    if b_length as usize != SUFFIX_LEN {
        return Err(Error::FileFormatError(format!(
            "suffix declares bLength {b_length}, expected {SUFFIX_LEN}"
        )));
    }
    if suffix[8..11] != SUFFIX_SIGNATURE {
        return Err(Error::FileFormatError(
            "missing \"DFU\" suffix signature".into(),
        ));
    }

    let stored_crc = LE::read_u32(&file[file.len() - 4..]);
    let computed_crc = compute_crc(&file[..file.len() - 4]);
    if stored_crc != computed_crc {
        return Err(Error::FileFormatError(format!(
            "suffix CRC mismatch: file says {stored_crc:#010x}, computed {computed_crc:#010x}"
        )));
    }

    let bcd_device = OptionalId::from_raw(LE::read_u16(&suffix[0..2]));
    let id_product = OptionalId::from_raw(LE::read_u16(&suffix[2..4]));
    let id_vendor = OptionalId::from_raw(LE::read_u16(&suffix[4..6]));
    let bcd_dfu = LE::read_u16(&suffix[6..8]);

    let payload = &file[..file.len() - SUFFIX_LEN];
    Ok((
        payload,
        SuffixInfo {
            bcd_device,
            id_product,
            id_vendor,
            bcd_dfu,
            crc: stored_crc,
        },
    ))
}

/// Append a freshly computed suffix to `payload` (`dfu-suffix --add`).
pub fn append_suffix(payload: &[u8], suffix: SuffixInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + SUFFIX_LEN);
    out.extend_from_slice(payload);

    let mut tail = [0u8; SUFFIX_LEN - 4];
    LE::write_u16(&mut tail[0..2], suffix.bcd_device.to_raw());
    LE::write_u16(&mut tail[2..4], suffix.id_product.to_raw());
    LE::write_u16(&mut tail[4..6], suffix.id_vendor.to_raw());
    LE::write_u16(&mut tail[6..8], suffix.bcd_dfu);
    tail[8..11].copy_from_slice(&SUFFIX_SIGNATURE);
    tail[11] = SUFFIX_LEN as u8;
    out.extend_from_slice(&tail);

    let crc = compute_crc(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Optional TI Stellaris prefix some Luminary Micro/TI bootloaders expect
/// ahead of the firmware payload (`dfu_file.h`'s `LMDFU_PREFIX`).
#[derive(Debug, Clone, Copy)]
pub struct StellarisPrefix {
    pub payload_words: u16,
    pub flash_address: u32,
}

/// Parse a Stellaris prefix if `payload` starts with its magic, returning
/// `(prefix, rest of payload)`.
pub fn parse_stellaris_prefix(payload: &[u8]) -> Option<(StellarisPrefix, &[u8])> {
    if payload.len() < STELLARIS_PREFIX_LEN || payload[0..2] != STELLARIS_MAGIC {
        return None;
    }

    let payload_words = LE::read_u16(&payload[2..4]);
    let flash_address = LE::read_u32(&payload[4..8]) * 1024;

    Some((
        StellarisPrefix {
            payload_words,
            flash_address,
        },
        &payload[STELLARIS_PREFIX_LEN..],
    ))
}

/// Build a Stellaris prefix for `data`, to be placed ahead of it.
pub fn build_stellaris_prefix(data: &[u8], flash_address: u32) -> Result<[u8; STELLARIS_PREFIX_LEN], Error> {
    if data.len() % 4 != 0 {
        return Err(Error::FileFormatError(
            "Stellaris images must be a multiple of 4 bytes".into(),
        ));
    }
    if flash_address % 1024 != 0 {
        return Err(Error::FileFormatError(
            "Stellaris flash address must be 1024-byte aligned".into(),
        ));
    }

    let mut prefix = [0u8; STELLARIS_PREFIX_LEN];
    prefix[0..2].copy_from_slice(&STELLARIS_MAGIC);
    LE::write_u16(&mut prefix[2..4], (data.len() / 4) as u16);
    LE::write_u32(&mut prefix[4..8], flash_address / 1024);
    Ok(prefix)
}

/// A fully loaded DFU file: optional Stellaris prefix, the raw firmware
/// payload (which may itself be a DfuSe container, see
/// [`crate::dfuse::file`]), and the suffix.
#[derive(Debug, Clone)]
pub struct FileImage {
    pub stellaris_prefix: Option<StellarisPrefix>,
    pub payload: Vec<u8>,
    pub suffix: SuffixInfo,
}

impl FileImage {
    pub fn load(bytes: &[u8]) -> Result<Self, Error> {
        let (body, suffix) = parse_suffix(bytes)?;
        let (stellaris_prefix, payload) = match parse_stellaris_prefix(body) {
            Some((prefix, rest)) => (Some(prefix), rest),
            None => (None, body),
        };
        Ok(Self {
            stellaris_prefix,
            payload: payload.to_vec(),
            suffix,
        })
    }

    pub fn is_dfuse(&self) -> bool {
        crate::dfuse::file::is_dfuse_image(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_known_vector() {
        // CRC-32/ISO-HDLC of the ASCII string "123456789" is 0xCBF43926;
        // compute_crc additionally inverts, so it is the bitwise NOT of
        // that standard value.
        let crc = compute_crc(b"123456789");
        assert_eq!(crc, !0xCBF43926u32);
    }

    #[test]
    fn suffix_round_trips() {
        let payload = b"firmware payload bytes";
        let suffix = SuffixInfo {
            bcd_device: OptionalId::Any,
            id_product: OptionalId::Id(0xdf11),
            id_vendor: OptionalId::Id(0x0483),
            bcd_dfu: 0x011a,
            crc: 0,
        };
        let file = append_suffix(payload, suffix);
        let (body, parsed) = parse_suffix(&file).unwrap();
        assert_eq!(body, payload);
        assert!(parsed.id_vendor.matches(0x0483));
        assert!(!parsed.id_vendor.matches(0x1234));
        assert!(parsed.bcd_device.matches(0x9999)); // Any
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let suffix = SuffixInfo {
            bcd_device: OptionalId::Any,
            id_product: OptionalId::Any,
            id_vendor: OptionalId::Any,
            bcd_dfu: 0x0100,
            crc: 0,
        };
        let mut file = append_suffix(b"original", suffix);
        let last = file.len() - SUFFIX_LEN - 1;
        file[last] ^= 0xff;
        assert!(parse_suffix(&file).is_err());
    }

    #[test]
    fn rejects_too_short_file() {
        assert!(parse_suffix(&[0u8; 4]).is_err());
    }

    #[test]
    fn stellaris_prefix_round_trips() {
        let data = [0xAAu8; 16];
        let prefix = build_stellaris_prefix(&data, 0x2000).unwrap();
        let mut image = Vec::new();
        image.extend_from_slice(&prefix);
        image.extend_from_slice(&data);

        let (parsed, rest) = parse_stellaris_prefix(&image).unwrap();
        assert_eq!(parsed.flash_address, 0x2000);
        assert_eq!(parsed.payload_words, 4);
        assert_eq!(rest, &data);
    }

    #[test]
    fn stellaris_prefix_rejects_misaligned_address() {
        assert!(build_stellaris_prefix(&[0u8; 4], 0x2001).is_err());
    }
}
