//! DFU state machine plumbing shared by every transfer engine: bringing a
//! device to a known state before a transfer, and polling it to completion
//! after one.
//!
//! Grounded on dfu-util's `main.c` (the `status_again:` reconciliation loop
//! and the runtime-to-DFU-mode detach dance) and the teacher's
//! `ensure_idle`/poll-after-download pattern in `protocol.rs`.

use std::thread;
use std::time::Duration;

use crate::descriptor::DfuAttributes;
use crate::error::Error;
use crate::quirks::QuirkFlags;
use crate::request;
use crate::status::{DfuState, DfuStatusResult};
use crate::transport::UsbTransport;

/// Drive the device back to `dfuIDLE` (or `dfuUPLOAD_IDLE`'s sibling case)
/// regardless of its current state, per dfu-util's `status_again` loop in
/// `main.c`'s `dfuload_do_dnload`/`dfuload_do_upload`.
///
/// - `dfuERROR` -> `DFU_CLRSTATUS`, loop.
/// - `dfuDNLOAD_IDLE`/`dfuUPLOAD_IDLE` -> `DFU_ABORT`, loop.
/// - `appIDLE`/`appDETACH` -> the device never left runtime mode.
/// - `dfuIDLE` -> done.
pub fn ensure_idle(transport: &impl UsbTransport, interface: u8) -> Result<(), Error> {
    const MAX_ITERATIONS: u32 = 16;

    for _ in 0..MAX_ITERATIONS {
        let status = request::get_status(transport, interface)?;
        match status.state {
            DfuState::dfuIDLE => return Ok(()),
            DfuState::dfuERROR => {
                request::clr_status(transport, interface)?;
            }
            DfuState::dfuDNLOAD_IDLE | DfuState::dfuUPLOAD_IDLE => {
                request::abort(transport, interface)?;
            }
            DfuState::appIDLE | DfuState::appDETACH => {
                return Err(Error::WrongMode(
                    "device is in runtime mode, not DFU mode".into(),
                ));
            }
            other => {
                return Err(Error::ProtocolError(format!(
                    "device stuck in unexpected state {other:?} while reconciling to dfuIDLE"
                )));
            }
        }
    }

    Err(Error::ProtocolError(
        "device did not reach dfuIDLE after repeated CLRSTATUS/ABORT".into(),
    ))
}

/// Sleep for `bwPollTimeout`, unless the device's quirk table says to
/// ignore it in favor of a fixed interval (`QUIRK_POLLTIMEOUT`, dfu-util).
pub fn poll_delay(status: &DfuStatusResult, quirks: QuirkFlags) {
    const FALLBACK_POLL_MS: u64 = 20;

    let ms = if quirks.contains(QuirkFlags::POLL_TIMEOUT) {
        FALLBACK_POLL_MS
    } else {
        status.poll_timeout as u64
    };

    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// Poll `DFU_GETSTATUS` after a `DFU_DNLOAD` until the device leaves
/// `dfuDNBUSY`, honoring `bwPollTimeout` between attempts
/// (`dfu_util.c`'s `dfu_poll_timeout` usage throughout `main.c`).
pub fn poll_until_not_busy(
    transport: &impl UsbTransport,
    interface: u8,
    quirks: QuirkFlags,
) -> Result<DfuStatusResult, Error> {
    const MAX_POLLS: u32 = 1000;

    let mut status = request::get_status(transport, interface)?;
    let mut polls = 0;
    while status.state == DfuState::dfuDNBUSY {
        if polls >= MAX_POLLS {
            return Err(Error::ProtocolError(
                "device stayed in dfuDNBUSY past the poll budget".into(),
            ));
        }
        poll_delay(&status, quirks);
        status = request::get_status(transport, interface)?;
        polls += 1;
    }
    status.ensure_ok()?;
    Ok(status)
}

/// Transition a runtime-mode interface into DFU mode: detach, then either
/// wait out `wDetachTimeOut` (if `attributes.contains(WILL_DETACH)`) or
/// force a bus reset, per DFU 1.1 spec §5.1 and dfu-util's
/// `main.c` (`if (dfu_root->func_dfu.bmAttributes & USB_DFU_WILL_DETACH)`).
pub fn detach_into_dfu_mode(
    transport: &impl UsbTransport,
    interface: u8,
    detach_timeout_ms: u16,
    attributes: DfuAttributes,
) -> Result<(), Error> {
    request::detach(transport, interface, detach_timeout_ms)?;

    if attributes.contains(DfuAttributes::WILL_DETACH) {
        thread::sleep(Duration::from_millis(detach_timeout_ms as u64));
    } else {
        transport.reset()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn ensure_idle_clears_error_state() {
        let t = MockTransport::new();
        t.state.borrow_mut().fail_next = Some(crate::status::DfuStatus::errVERIFY);
        // First GETSTATUS reports the injected error and moves to dfuERROR.
        let status = request::get_status(&t, 0).unwrap();
        assert_eq!(status.state, DfuState::dfuERROR);
        ensure_idle(&t, 0).unwrap();
        assert_eq!(t.state.borrow().clrstatus_count, 1);
    }

    #[test]
    fn ensure_idle_aborts_from_dnload_idle() {
        let t = MockTransport::new();
        request::dnload(&t, 0, 0, b"x").unwrap();
        ensure_idle(&t, 0).unwrap();
        assert_eq!(t.state.borrow().abort_count, 1);
    }

    #[test]
    fn ensure_idle_rejects_runtime_mode() {
        let t = MockTransport::new();
        t.state.borrow_mut().state = DfuState::appIDLE;
        assert!(matches!(ensure_idle(&t, 0), Err(Error::WrongMode(_))));
    }
}
