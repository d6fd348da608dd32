//! In-process mock of [`UsbTransport`], modeled on `dfu-core`'s
//! `tests/mock.rs` `MockIO`. Simulates a DFU state machine entirely in
//! memory so the protocol and engine layers can be exercised without real
//! hardware.

use std::cell::RefCell;

use crate::error::Error;
use crate::status::{DfuState, DfuStatus};

use super::UsbTransport;

/// Bytes received by `DFU_DNLOAD`, or memory to serve back on `DFU_UPLOAD`,
/// keyed by the simulated device's current understanding of the transfer.
#[derive(Debug, Default)]
pub struct MockState {
    pub state: DfuState,
    pub status: DfuStatus,
    pub poll_timeout_ms: u32,
    /// Concatenation of every DNLOAD payload received, in order.
    pub downloaded: Vec<u8>,
    /// Data returned by successive UPLOAD requests.
    pub upload_source: Vec<u8>,
    pub upload_cursor: usize,
    pub last_block_num: Option<u16>,
    /// Forces the next GETSTATUS reply into an error state, simulating a
    /// device-side failure mid-transfer.
    pub fail_next: Option<DfuStatus>,
    pub abort_count: u32,
    pub clrstatus_count: u32,
    pub detach_count: u32,
}

pub struct MockTransport {
    pub state: RefCell<MockState>,
    pub max_packet_size_0: u16,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(MockState::default()),
            max_packet_size_0: 64,
        }
    }

    pub fn with_upload_data(data: Vec<u8>) -> Self {
        let mock = Self::new();
        mock.state.borrow_mut().upload_source = data;
        mock
    }
}

const DFU_DETACH: u8 = 0;
const DFU_DNLOAD: u8 = 1;
const DFU_UPLOAD: u8 = 2;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_ABORT: u8 = 6;

impl UsbTransport for MockTransport {
    fn control_write(
        &self,
        _request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        data: &[u8],
    ) -> Result<usize, Error> {
        let mut s = self.state.borrow_mut();
        match request {
            DFU_DETACH => {
                s.detach_count += 1;
                s.state = DfuState::appDETACH;
                Ok(0)
            }
            DFU_DNLOAD => {
                if data.is_empty() {
                    // Zero-length DNLOAD: manifestation trigger.
                    s.state = DfuState::dfuMANIFEST_SYNC;
                } else {
                    s.downloaded.extend_from_slice(data);
                    s.last_block_num = Some(value);
                    s.state = DfuState::dfuDNLOAD_SYNC;
                }
                Ok(data.len())
            }
            DFU_CLRSTATUS => {
                s.clrstatus_count += 1;
                s.status = DfuStatus::OK;
                s.state = DfuState::dfuIDLE;
                Ok(0)
            }
            DFU_ABORT => {
                s.abort_count += 1;
                s.state = DfuState::dfuIDLE;
                Ok(0)
            }
            _ => Err(Error::ProtocolError(format!("unexpected request {request}"))),
        }
    }

    fn control_read(
        &self,
        _request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        data: &mut [u8],
    ) -> Result<usize, Error> {
        let mut s = self.state.borrow_mut();
        match request {
            DFU_GETSTATUS => {
                if let Some(fail) = s.fail_next.take() {
                    s.status = fail;
                    s.state = DfuState::dfuERROR;
                } else {
                    s.state = match s.state {
                        DfuState::dfuDNLOAD_SYNC => DfuState::dfuDNLOAD_IDLE,
                        DfuState::dfuMANIFEST_SYNC => DfuState::dfuIDLE,
                        other => other,
                    };
                }
                data[0] = s.status as u8;
                data[1] = (s.poll_timeout_ms & 0xff) as u8;
                data[2] = ((s.poll_timeout_ms >> 8) & 0xff) as u8;
                data[3] = ((s.poll_timeout_ms >> 16) & 0xff) as u8;
                data[4] = s.state as u8;
                data[5] = 0;
                Ok(6)
            }
            DFU_UPLOAD => {
                let remaining = s.upload_source.len() - s.upload_cursor;
                let n = remaining.min(data.len());
                let start = s.upload_cursor;
                data[..n].copy_from_slice(&s.upload_source[start..start + n]);
                s.upload_cursor += n;
                s.state = if n < data.len() {
                    DfuState::dfuIDLE
                } else {
                    DfuState::dfuUPLOAD_IDLE
                };
                Ok(n)
            }
            _ => Err(Error::ProtocolError(format!("unexpected request {request}"))),
        }
    }

    fn claim_interface(&self, _interface: u8) -> Result<(), Error> {
        Ok(())
    }

    fn release_interface(&self, _interface: u8) -> Result<(), Error> {
        Ok(())
    }

    fn set_alternate_setting(&self, _interface: u8, _setting: u8) -> Result<(), Error> {
        Ok(())
    }

    fn reset(&self) -> Result<(), Error> {
        Ok(())
    }

    fn max_packet_size_0(&self) -> u16 {
        self.max_packet_size_0
    }
}
