//! Address-oriented DfuSe download/upload engine.
//!
//! Grounded on `dfuse.c`'s `dfuse_dnload_element`/`dfuse_do_upload`: every
//! chunk is preceded by a `SET_ADDRESS_POINTER` special command, and write
//! chunks additionally erase their covering page first, skipping the erase
//! when it's the same page as the one just erased.

use crate::dfuse::commands::DfuSeContext;
use crate::error::Error;
use crate::memory_layout::{MemorySegment, SectorFlags};
use crate::request;
use crate::state_machine;
use crate::status::DfuState;
use crate::transport::UsbTransport;

/// DfuSe reserves `DFU_DNLOAD` block 0 for special commands; real data
/// blocks start at 2 and the address comes entirely from the preceding
/// `SET_ADDRESS_POINTER`, so the block number itself carries no addressing
/// meaning beyond "not 0 or 1".
const DATA_BLOCK_NUM: u16 = 2;

#[derive(Debug, Default)]
pub struct DfuSeEngine {
    pub context: DfuSeContext,
}

impl DfuSeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `image` starting at `base_address`, erasing each page the
    /// first time a chunk touches it. Per spec §4.5 item 1, the element's
    /// last address is checked against a writeable segment before any
    /// `DNLOAD` is issued; each individual chunk's starting address is
    /// re-checked as it's written (item 2a).
    ///
    /// This writes data only; it does not manifest. DfuSe only leaves DFU
    /// mode when the caller explicitly requests it (spec §4.5 item 3) via
    /// [`Self::leave`], unlike the generic engine which always manifests
    /// after the last block.
    pub fn download(
        &mut self,
        transport: &impl UsbTransport,
        interface: u8,
        segments: &[MemorySegment],
        base_address: u32,
        block_size: u32,
        image: &[u8],
        mut progress: Option<&mut dyn FnMut(u64, Option<u64>)>,
    ) -> Result<(), Error> {
        let block_size = block_size.max(1);

        if let Some(last_byte) = image.len().checked_sub(1) {
            let last_address = base_address.wrapping_add(last_byte as u32);
            self.require_writeable(segments, last_address)?;
        }

        let mut offset: u64 = 0;
        for chunk in image.chunks(block_size as usize) {
            let address = base_address.wrapping_add(offset as u32);
            self.require_writeable(segments, address)?;
            self.erase_covering_pages(transport, interface, segments, address, chunk.len() as u32)?;

            self.context.set_address(transport, interface, address)?;
            request::dnload(transport, interface, DATA_BLOCK_NUM, chunk)?;
            state_machine::poll_until_not_busy(transport, interface, Default::default())?;

            offset += chunk.len() as u64;
            if let Some(cb) = progress.as_deref_mut() {
                cb(offset, Some(image.len() as u64));
            }
        }

        Ok(())
    }

    fn require_writeable(&self, segments: &[MemorySegment], address: u32) -> Result<(), Error> {
        let segment = segments
            .iter()
            .find(|s| s.contains(address))
            .ok_or(Error::AddressError {
                address,
                requirement: "within any memory segment",
            })?;
        let (_, run) = segment.sector_at(address).ok_or(Error::AddressError {
            address,
            requirement: "aligned to a known sector",
        })?;
        if !run.flags.contains(SectorFlags::WRITEABLE) {
            return Err(Error::AddressError {
                address,
                requirement: "writeable",
            });
        }
        Ok(())
    }

    /// Erase every page spanned by `[address, address + chunk_len - 1]`, per
    /// spec §4.5 item 2b (`dfuse.c`'s `dfuse_dnload_element` erase loop),
    /// not just the page containing the chunk's first byte. Pages already
    /// covered by `last_erased` are skipped by [`DfuSeContext::erase_page`].
    fn erase_covering_pages(
        &mut self,
        transport: &impl UsbTransport,
        interface: u8,
        segments: &[MemorySegment],
        address: u32,
        chunk_len: u32,
    ) -> Result<(), Error> {
        let last_address = address.wrapping_add(chunk_len.max(1) - 1);
        let mut cursor = address;

        loop {
            let segment = segments
                .iter()
                .find(|s| s.contains(cursor))
                .ok_or(Error::AddressError {
                    address: cursor,
                    requirement: "within any memory segment",
                })?;

            let (page_start, run) = segment.sector_at(cursor).ok_or(Error::AddressError {
                address: cursor,
                requirement: "aligned to a known sector",
            })?;

            if !run.flags.contains(SectorFlags::ERASABLE) {
                return Err(Error::AddressError {
                    address: cursor,
                    requirement: "erasable",
                });
            }

            self.context.erase_page(transport, interface, page_start)?;

            let page_end = page_start.wrapping_add(run.size);
            if page_end > last_address || run.size == 0 {
                break;
            }
            cursor = page_end;
        }

        Ok(())
    }

    /// Trigger execution of the downloaded firmware: `SET_ADDRESS` to
    /// `address` (the start of the last element written) followed by a
    /// zero-length `DNLOAD`, per spec §4.5 item 3 (`dfu-util`'s `:leave`
    /// option). Only called when the caller's DfuSe options set `leave`.
    pub fn leave(&mut self, transport: &impl UsbTransport, interface: u8, address: u32) -> Result<(), Error> {
        self.context.set_address(transport, interface, address)?;
        request::dnload(transport, interface, DATA_BLOCK_NUM, &[])?;
        let status = request::get_status(transport, interface)?;
        status.ensure_ok()?;
        match status.state {
            DfuState::dfuMANIFEST
            | DfuState::dfuMANIFEST_SYNC
            | DfuState::dfuMANIFEST_WAIT_RESET
            | DfuState::dfuIDLE => Ok(()),
            other => Err(Error::ProtocolError(format!(
                "unexpected state {other:?} after DfuSe manifestation"
            ))),
        }
    }

    /// Read `length` bytes starting at `base_address`.
    pub fn upload(
        &mut self,
        transport: &impl UsbTransport,
        interface: u8,
        base_address: u32,
        length: u32,
        block_size: u32,
        mut progress: Option<&mut dyn FnMut(u64, Option<u64>)>,
    ) -> Result<Vec<u8>, Error> {
        let block_size = block_size.max(1);
        let mut data = Vec::with_capacity(length as usize);
        let mut offset: u32 = 0;

        while offset < length {
            let address = base_address.wrapping_add(offset);
            self.context.set_address(transport, interface, address)?;

            let remaining = length - offset;
            let want = remaining.min(block_size) as usize;
            let mut buf = vec![0u8; want];
            let n = request::upload(transport, interface, DATA_BLOCK_NUM, &mut buf)?;
            data.extend_from_slice(&buf[..n]);
            offset += n as u32;

            if let Some(cb) = progress.as_deref_mut() {
                cb(data.len() as u64, Some(length as u64));
            }

            if n < want {
                break;
            }
        }

        request::abort(transport, interface)?;
        Ok(data)
    }
}
