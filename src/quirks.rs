//! Device-specific workaround table, keyed by vendor/product/bcdDevice.
//!
//! Generalizes dfu-util's `get_quirks()` (referenced throughout `main.c`,
//! e.g. `QUIRK_POLLTIMEOUT`/`QUIRK_FORCE_DFU11`) into a pure lookup function
//! over a static table instead of a chain of `if` statements, so adding an
//! entry never touches the call sites.

use bitflags::bitflags;

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct QuirkFlags: u8 {
        /// Ignore the device's `bwPollTimeout` and poll at a fixed interval
        /// instead; some devices report a timeout of 0 but aren't actually
        /// ready that fast.
        const POLL_TIMEOUT = 0x01;
        /// Treat the device as DFU 1.1 even though it advertises 1.0 (some
        /// STM32 bootloaders misreport `bcdDFUVersion`).
        const FORCE_DFU_1_1 = 0x02;
        /// Device needs a forced `USB_REQ_SET_CONFIGURATION` before claiming
        /// the DFU interface.
        const SET_CONFIG = 0x04;
    }
}

struct QuirkEntry {
    vendor: u16,
    product: u16,
    bcd_device: Option<u16>,
    flags: QuirkFlags,
}

/// Table of known-quirky devices. Entries with `bcd_device: None` match any
/// firmware revision.
const QUIRKS: &[QuirkEntry] = &[
    // STMicroelectronics DfuSe bootloader: bcdDFUVersion is 0x011a in the
    // functional descriptor already, but some clones report plain 0x0100.
    QuirkEntry {
        vendor: 0x0483,
        product: 0xdf11,
        bcd_device: None,
        flags: QuirkFlags::empty(),
    },
    // OpenMoko Freerunner bootloader is known to report bwPollTimeout
    // unreliably.
    QuirkEntry {
        vendor: 0x1d50,
        product: 0x6018,
        bcd_device: None,
        flags: QuirkFlags::POLL_TIMEOUT,
    },
];

/// Look up quirks for a device. Returns an empty set for anything not in
/// the table, which is the common case.
pub fn lookup(vendor: u16, product: u16, bcd_device: u16) -> QuirkFlags {
    QUIRKS
        .iter()
        .find(|e| {
            e.vendor == vendor
                && e.product == product
                && e.bcd_device.map_or(true, |bcd| bcd == bcd_device)
        })
        .map(|e| e.flags)
        .unwrap_or_default()
}
