//! DfuSe special commands, sent as the payload of a `DFU_DNLOAD` to block
//! number 0 (`dfuse_special_command`, `dfuse.c`).

use byteorder::{ByteOrder, LE};

use crate::error::Error;
use crate::request;
use crate::status::DfuState;
use crate::transport::UsbTransport;

const SET_ADDRESS_POINTER: u8 = 0x21;
const ERASE_PAGE: u8 = 0x41;
const READ_UNPROTECT: u8 = 0x92;

/// Threaded explicitly through every DfuSe operation instead of the file
/// scope globals `dfuse.c` keeps (`dfuse_address`, `last_erased`), per the
/// ownership-of-state redesign.
#[derive(Debug, Default)]
pub struct DfuSeContext {
    /// Whether the caller authorized `MASS_ERASE`/`READ_UNPROTECT`, the two
    /// special commands that can irrecoverably wipe or unlock the device
    /// (spec §4.4 safety policy).
    pub force: bool,
    /// Page address last erased, so consecutive writes within the same
    /// page skip a redundant erase (mirrors `dfuse_dnload_element`'s
    /// `last_erased` tracking).
    last_erased_page: Option<u32>,
    current_address: u32,
    /// Whether `force_last_erased` was observed unset at least once; kept
    /// only so tests can assert erase-call counts deterministically.
    erase_calls: u32,
}

impl DfuSeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_force(force: bool) -> Self {
        Self {
            force,
            ..Self::default()
        }
    }

    pub fn current_address(&self) -> u32 {
        self.current_address
    }

    pub fn erase_calls(&self) -> u32 {
        self.erase_calls
    }

    /// Send `DFU_DNLOAD` for a special command and wait for it to take
    /// effect (`dfuDNBUSY` -> `dfuDNLOAD_IDLE`), per `dfuse_special_command`.
    fn run_command(
        &self,
        transport: &impl UsbTransport,
        interface: u8,
        payload: &[u8],
    ) -> Result<(), Error> {
        request::dnload(transport, interface, 0, payload)?;
        let status = request::get_status(transport, interface)?;
        status.ensure_ok()?;
        status.state.ensure(DfuState::dfuDNLOAD_IDLE).map_err(Error::from)?;
        Ok(())
    }

    /// `0x21 <addr:u32 LE>`: point the device's write cursor at `address`.
    /// dfu-util issues this before every element and redundantly before
    /// every page-sized chunk within an element; the redundancy is
    /// preserved here (spec Open Question, resolved: keep it, it's cheap
    /// and some clones rely on it).
    pub fn set_address(
        &mut self,
        transport: &impl UsbTransport,
        interface: u8,
        address: u32,
    ) -> Result<(), Error> {
        let mut payload = [0u8; 5];
        payload[0] = SET_ADDRESS_POINTER;
        LE::write_u32(&mut payload[1..5], address);
        self.run_command(transport, interface, &payload)?;
        self.current_address = address;
        Ok(())
    }

    /// `0x41 <addr:u32 LE>`: erase the page containing `address`. Skipped
    /// if the immediately preceding erase already covered the same page.
    pub fn erase_page(
        &mut self,
        transport: &impl UsbTransport,
        interface: u8,
        page_address: u32,
    ) -> Result<(), Error> {
        if self.last_erased_page == Some(page_address) {
            return Ok(());
        }

        let mut payload = [0u8; 5];
        payload[0] = ERASE_PAGE;
        LE::write_u32(&mut payload[1..5], page_address);
        self.run_command(transport, interface, &payload)?;
        self.last_erased_page = Some(page_address);
        self.erase_calls += 1;
        Ok(())
    }

    /// `0x41` with no address: mass-erase the whole device. Refused unless
    /// `self.force` is set (spec §4.4 safety policy) — the check runs
    /// before any DNLOAD is issued.
    pub fn mass_erase(&mut self, transport: &impl UsbTransport, interface: u8) -> Result<(), Error> {
        if !self.force {
            return Err(Error::UsageError(
                "--mass-erase requires --force: it is irreversible".into(),
            ));
        }
        self.run_command(transport, interface, &[ERASE_PAGE])?;
        self.last_erased_page = None;
        self.erase_calls += 1;
        Ok(())
    }

    /// `0x92`: disable read protection. Some devices mass-erase as a side
    /// effect and then detach, so the caller must re-enumerate afterward.
    /// Refused unless `self.force` is set, for the same reason as
    /// `mass_erase`.
    pub fn read_unprotect(&mut self, transport: &impl UsbTransport, interface: u8) -> Result<(), Error> {
        if !self.force {
            return Err(Error::UsageError(
                "--unprotect requires --force: it erases the device".into(),
            ));
        }
        self.run_command(transport, interface, &[READ_UNPROTECT])?;
        self.last_erased_page = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn set_address_updates_context() {
        let t = MockTransport::new();
        let mut ctx = DfuSeContext::new();
        ctx.set_address(&t, 0, 0x0800_0000).unwrap();
        assert_eq!(ctx.current_address(), 0x0800_0000);
    }

    #[test]
    fn repeated_erase_of_same_page_is_skipped() {
        let t = MockTransport::new();
        let mut ctx = DfuSeContext::new();
        ctx.erase_page(&t, 0, 0x0800_0000).unwrap();
        ctx.erase_page(&t, 0, 0x0800_0000).unwrap();
        assert_eq!(ctx.erase_calls(), 1);
    }

    #[test]
    fn erase_of_new_page_is_not_skipped() {
        let t = MockTransport::new();
        let mut ctx = DfuSeContext::new();
        ctx.erase_page(&t, 0, 0x0800_0000).unwrap();
        ctx.erase_page(&t, 0, 0x0800_4000).unwrap();
        assert_eq!(ctx.erase_calls(), 2);
    }

    #[test]
    fn mass_erase_without_force_is_rejected() {
        let t = MockTransport::new();
        let mut ctx = DfuSeContext::new();
        let err = ctx.mass_erase(&t, 0).unwrap_err();
        assert!(matches!(err, Error::UsageError(_)));
        assert_eq!(t.state.borrow().downloaded.len(), 0);
    }

    #[test]
    fn mass_erase_with_force_runs() {
        let t = MockTransport::new();
        let mut ctx = DfuSeContext::with_force(true);
        ctx.mass_erase(&t, 0).unwrap();
    }

    #[test]
    fn read_unprotect_without_force_is_rejected() {
        let t = MockTransport::new();
        let mut ctx = DfuSeContext::new();
        assert!(matches!(ctx.read_unprotect(&t, 0), Err(Error::UsageError(_))));
    }
}
