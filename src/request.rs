//! The six DFU class-specific control requests (USB DFU 1.1 spec §3).
//!
//! Each function issues exactly one control transfer over a [`UsbTransport`]
//! and decodes the reply where applicable; none of them interpret the
//! resulting state machine transition, that's [`crate::state_machine`]'s job.

use crate::error::Error;
use crate::status::DfuStatusResult;
use crate::transport::UsbTransport;

const USB_TYPE_CLASS: u8 = 0x01 << 5;
const USB_RECIP_INTERFACE: u8 = 0x01;

const DIR_OUT: u8 = 0x00;
const DIR_IN: u8 = 0x80;

const REQUEST_TYPE_OUT: u8 = DIR_OUT | USB_TYPE_CLASS | USB_RECIP_INTERFACE;
const REQUEST_TYPE_IN: u8 = DIR_IN | USB_TYPE_CLASS | USB_RECIP_INTERFACE;

const DFU_DETACH: u8 = 0;
const DFU_DNLOAD: u8 = 1;
const DFU_UPLOAD: u8 = 2;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_ABORT: u8 = 6;

/// `DFU_DETACH`: ask a runtime-mode device to reboot into DFU mode.
/// `timeout_ms` is the value from the functional descriptor's
/// `wDetachTimeOut`, echoed back as `wValue`.
pub fn detach(transport: &impl UsbTransport, interface: u8, timeout_ms: u16) -> Result<(), Error> {
    transport.control_write(REQUEST_TYPE_OUT, DFU_DETACH, timeout_ms, interface as u16, &[])?;
    Ok(())
}

/// `DFU_DNLOAD`: send one block of firmware data (or a zero-length block to
/// signal end-of-transfer / trigger manifestation).
pub fn dnload(
    transport: &impl UsbTransport,
    interface: u8,
    block_num: u16,
    data: &[u8],
) -> Result<usize, Error> {
    transport.control_write(REQUEST_TYPE_OUT, DFU_DNLOAD, block_num, interface as u16, data)
}

/// `DFU_UPLOAD`: read one block of firmware data from the device.
pub fn upload(
    transport: &impl UsbTransport,
    interface: u8,
    block_num: u16,
    buf: &mut [u8],
) -> Result<usize, Error> {
    transport.control_read(REQUEST_TYPE_IN, DFU_UPLOAD, block_num, interface as u16, buf)
}

/// `DFU_GETSTATUS`: fetch the device's 6-byte status/state/poll-timeout
/// reply.
pub fn get_status(transport: &impl UsbTransport, interface: u8) -> Result<DfuStatusResult, Error> {
    let mut buf = [0u8; 6];
    let n = transport.control_read(REQUEST_TYPE_IN, DFU_GETSTATUS, 0, interface as u16, &mut buf)?;
    DfuStatusResult::parse(&buf[..n])
}

/// `DFU_CLRSTATUS`: clear `dfuERROR`, returning the device to `dfuIDLE`.
pub fn clr_status(transport: &impl UsbTransport, interface: u8) -> Result<(), Error> {
    transport.control_write(REQUEST_TYPE_OUT, DFU_CLRSTATUS, 0, interface as u16, &[])?;
    Ok(())
}

/// `DFU_ABORT`: leave `dfuDNLOAD_IDLE`/`dfuUPLOAD_IDLE` and return to
/// `dfuIDLE` without completing the transfer.
pub fn abort(transport: &impl UsbTransport, interface: u8) -> Result<(), Error> {
    transport.control_write(REQUEST_TYPE_OUT, DFU_ABORT, 0, interface as u16, &[])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn dnload_then_getstatus_round_trips() {
        let t = MockTransport::new();
        dnload(&t, 0, 0, b"firmware bytes").unwrap();
        let status = get_status(&t, 0).unwrap();
        status.ensure_ok().unwrap();
    }

    #[test]
    fn abort_resets_to_idle() {
        let t = MockTransport::new();
        dnload(&t, 0, 0, b"x").unwrap();
        abort(&t, 0).unwrap();
        assert_eq!(t.state.borrow().abort_count, 1);
    }

    #[test]
    fn clr_status_clears_error() {
        let t = MockTransport::new();
        clr_status(&t, 0).unwrap();
        assert_eq!(t.state.borrow().clrstatus_count, 1);
    }
}
