//! DfuSe file container format: an 11-byte file prefix, one 274-byte
//! target prefix per target, and an 8-byte element header before each
//! element's raw data. Grounded on `dfuse_do_dfuse_dnload` (`dfuse.c`) and
//! ST AN3156.
//!
//! This operates on the payload *inside* the outer DFU suffix; callers
//! strip the suffix with [`crate::file_format`] first.

use byteorder::{ByteOrder, LE};

use crate::error::Error;

const FILE_SIGNATURE: &[u8; 5] = b"DfuSe";
const TARGET_SIGNATURE: &[u8; 6] = b"Target";
const FILE_PREFIX_LEN: usize = 11;
const TARGET_PREFIX_LEN: usize = 274;
const TARGET_NAME_LEN: usize = 255;
const ELEMENT_HEADER_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct DfuSeElement {
    pub address: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DfuSeTarget {
    pub alt_setting: u8,
    pub name: Option<String>,
    pub elements: Vec<DfuSeElement>,
}

#[derive(Debug, Clone)]
pub struct DfuSeImage {
    pub version: u8,
    pub targets: Vec<DfuSeTarget>,
}

/// True if `payload` begins with the `"DfuSe"` file signature.
pub fn is_dfuse_image(payload: &[u8]) -> bool {
    payload.len() >= FILE_PREFIX_LEN && &payload[0..5] == FILE_SIGNATURE
}

/// Parse the DfuSe container (spec §5 DfuSe file format).
pub fn parse(payload: &[u8]) -> Result<DfuSeImage, Error> {
    if !is_dfuse_image(payload) {
        return Err(Error::FileFormatError(
            "missing \"DfuSe\" file signature".into(),
        ));
    }

    let version = payload[5];
    let declared_size = LE::read_u32(&payload[6..10]) as usize;
    let num_targets = payload[10];

    if declared_size != payload.len() {
        return Err(Error::FileFormatError(format!(
            "DfuSe image size field says {declared_size} bytes but file has {}",
            payload.len()
        )));
    }

    let mut cursor = FILE_PREFIX_LEN;
    let mut targets = Vec::with_capacity(num_targets as usize);

    for _ in 0..num_targets {
        let (target, consumed) = parse_target(&payload[cursor..])?;
        targets.push(target);
        cursor += consumed;
    }

    Ok(DfuSeImage { version, targets })
}

fn parse_target(buf: &[u8]) -> Result<(DfuSeTarget, usize), Error> {
    if buf.len() < TARGET_PREFIX_LEN {
        return Err(Error::FileFormatError(
            "truncated DfuSe target prefix".into(),
        ));
    }
    if &buf[0..6] != TARGET_SIGNATURE {
        return Err(Error::FileFormatError(
            "missing \"Target\" signature in DfuSe target prefix".into(),
        ));
    }

    let alt_setting = buf[6];
    let named = LE::read_u32(&buf[7..11]) != 0;
    let name_bytes = &buf[11..11 + TARGET_NAME_LEN];
    let name = if named {
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        Some(String::from_utf8_lossy(&name_bytes[..end]).into_owned())
    } else {
        None
    };

    let target_size = LE::read_u32(&buf[266..270]) as usize;
    let num_elements = LE::read_u32(&buf[270..274]);

    let mut cursor = TARGET_PREFIX_LEN;
    let mut elements = Vec::with_capacity(num_elements as usize);
    let mut element_bytes = 0usize;

    for _ in 0..num_elements {
        if buf.len() < cursor + ELEMENT_HEADER_LEN {
            return Err(Error::FileFormatError(
                "truncated DfuSe element header".into(),
            ));
        }
        let address = LE::read_u32(&buf[cursor..cursor + 4]);
        let size = LE::read_u32(&buf[cursor + 4..cursor + 8]) as usize;
        cursor += ELEMENT_HEADER_LEN;

        if buf.len() < cursor + size {
            return Err(Error::FileFormatError(
                "truncated DfuSe element data".into(),
            ));
        }
        elements.push(DfuSeElement {
            address,
            data: buf[cursor..cursor + size].to_vec(),
        });
        cursor += size;
        element_bytes += ELEMENT_HEADER_LEN + size;
    }

    if element_bytes != target_size {
        return Err(Error::FileFormatError(format!(
            "DfuSe target declares {target_size} bytes of elements but contains {element_bytes}"
        )));
    }

    Ok((
        DfuSeTarget {
            alt_setting,
            name,
            elements,
        },
        cursor,
    ))
}

/// Serialize targets back into a DfuSe payload (used by tooling that
/// repacks images; `dfu-suffix` itself never needs this).
pub fn build(version: u8, targets: &[DfuSeTarget]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(FILE_SIGNATURE);
    out.push(version);
    out.extend_from_slice(&[0u8; 4]); // size patched below
    out.push(targets.len() as u8);

    for target in targets {
        out.extend_from_slice(TARGET_SIGNATURE);
        out.push(target.alt_setting);
        out.extend_from_slice(&(target.name.is_some() as u32).to_le_bytes());
        let mut name_buf = [0u8; TARGET_NAME_LEN];
        if let Some(name) = &target.name {
            let bytes = name.as_bytes();
            let n = bytes.len().min(TARGET_NAME_LEN - 1);
            name_buf[..n].copy_from_slice(&bytes[..n]);
        }
        out.extend_from_slice(&name_buf);

        let target_size: usize = target
            .elements
            .iter()
            .map(|e| ELEMENT_HEADER_LEN + e.data.len())
            .sum();
        out.extend_from_slice(&(target_size as u32).to_le_bytes());
        out.extend_from_slice(&(target.elements.len() as u32).to_le_bytes());

        for element in &target.elements {
            out.extend_from_slice(&element.address.to_le_bytes());
            out.extend_from_slice(&(element.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&element.data);
        }
    }

    let total_len = out.len() as u32;
    out[6..10].copy_from_slice(&total_len.to_le_bytes());
    out
}
