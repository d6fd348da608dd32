//! DFU functional descriptor (USB DFU 1.1 spec, table 4.2).

use byteorder::{ByteOrder, LE};

use crate::error::Error;

pub const USB_DT_DFU: u8 = 0x21;
/// Length of the descriptor on DFU 1.0 devices, which lack `bcdDFUVersion`.
pub const DFU_1_0_DESCRIPTOR_LEN: usize = 7;
/// Length of the descriptor on DFU 1.1/DfuSe devices.
pub const DFU_1_1_DESCRIPTOR_LEN: usize = 9;

bitflags::bitflags! {
    /// `bmAttributes` bit flags.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct DfuAttributes: u8 {
        const CAN_DOWNLOAD = 0x01;
        const CAN_UPLOAD = 0x02;
        const MANIFESTATION_TOLERANT = 0x04;
        const WILL_DETACH = 0x08;
    }
}

pub const BCD_DFU_1_0: u16 = 0x0100;
pub const BCD_DFU_1_1: u16 = 0x0110;
pub const BCD_DFUSE: u16 = 0x011a;

/// Functional descriptor as the DFU device reports it.
///
/// Invariant: `transfer_size >= bMaxPacketSize0`; enforced by
/// [`DfuFunctionalDescriptor::clamp_transfer_size`], not at construction,
/// since the device descriptor isn't always known yet when this is parsed.
#[derive(Copy, Clone, Debug)]
pub struct DfuFunctionalDescriptor {
    pub attributes: DfuAttributes,
    pub detach_timeout_ms: u16,
    pub transfer_size: u16,
    pub dfu_version: u16,
}

impl DfuFunctionalDescriptor {
    /// Parse from the 7- or 9-byte DFU functional descriptor body (i.e. the
    /// descriptor payload *after* `bLength`/`bDescriptorType`, matching how
    /// `usb_get_any_descriptor`/cached-extra-descriptor lookups return it
    /// minus the two-byte header already stripped by the caller).
    ///
    /// `bmAttributes` sits at offset 0, `wDetachTimeOut` at 1..3,
    /// `wTransferSize` at 3..5, `bcdDFUVersion` at 5..7 when present.
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        if body.len() < DFU_1_0_DESCRIPTOR_LEN {
            return Err(Error::ProtocolError(format!(
                "DFU functional descriptor too short: {} bytes",
                body.len()
            )));
        }

        let attributes = DfuAttributes::from_bits_truncate(body[0]);
        let detach_timeout_ms = LE::read_u16(&body[1..3]);
        let transfer_size = LE::read_u16(&body[3..5]);
        let dfu_version = if body.len() >= DFU_1_1_DESCRIPTOR_LEN {
            LE::read_u16(&body[5..7])
        } else {
            BCD_DFU_1_0
        };

        Ok(Self {
            attributes,
            detach_timeout_ms,
            transfer_size,
            dfu_version,
        })
    }

    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == BCD_DFUSE
    }

    /// Clamp `transfer_size` upward to the device's control endpoint 0
    /// packet size, and (on platforms with a page-size limit on USB bulk
    /// transfers through usbfs, e.g. Linux) downward to that limit.
    pub fn clamp_transfer_size(&self, max_packet_size_0: u16, host_limit: Option<u32>) -> u32 {
        let mut size = self.transfer_size.max(max_packet_size_0) as u32;
        if let Some(limit) = host_limit {
            if size > limit {
                size = limit;
            }
        }
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dfu_1_1_descriptor() {
        let body = [0x0d, 0x00, 0x04, 0x40, 0x00, 0x10, 0x01];
        let desc = DfuFunctionalDescriptor::parse(&body).unwrap();
        assert!(desc.attributes.contains(DfuAttributes::CAN_DOWNLOAD));
        assert!(desc.attributes.contains(DfuAttributes::MANIFESTATION_TOLERANT));
        assert!(!desc.attributes.contains(DfuAttributes::CAN_UPLOAD));
        assert_eq!(desc.detach_timeout_ms, 0x0004);
        assert_eq!(desc.transfer_size, 0x4000);
        assert_eq!(desc.dfu_version, BCD_DFU_1_1);
    }

    #[test]
    fn falls_back_to_dfu_1_0_when_short() {
        let body = [0x00, 0xe8, 0x03, 0x00, 0x02];
        let desc = DfuFunctionalDescriptor::parse(&body).unwrap();
        assert_eq!(desc.dfu_version, BCD_DFU_1_0);
    }

    #[test]
    fn clamps_transfer_size_both_ways() {
        let desc = DfuFunctionalDescriptor {
            attributes: DfuAttributes::empty(),
            detach_timeout_ms: 0,
            transfer_size: 4,
            dfu_version: BCD_DFU_1_1,
        };
        assert_eq!(desc.clamp_transfer_size(64, None), 64);

        let desc = DfuFunctionalDescriptor {
            transfer_size: 4096,
            ..desc
        };
        assert_eq!(desc.clamp_transfer_size(64, Some(2048)), 2048);
    }
}
