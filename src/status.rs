//! Status/state codes from the USB DFU 1.1 specification, table 6.1 and 6.2.

use byteorder::{ByteOrder, LE};
use num_enum::TryFromPrimitive;

use crate::error::{Error, StateError};

/// Status codes a DFU device can report in `bStatus`.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, TryFromPrimitive)]
#[allow(non_camel_case_types)] // Names from DFU spec
pub enum DfuStatus {
    #[default]
    OK = 0x00,
    errTARGET = 0x01,
    errFILE = 0x02,
    errWRITE = 0x03,
    errERASE = 0x04,
    errCHECK_ERASED = 0x05,
    errPROG = 0x06,
    errVERIFY = 0x07,
    errADDRESS = 0x08,
    errNOTDONE = 0x09,
    errFIRMWARE = 0x0a,
    errVENDOR = 0x0b,
    errUSBR = 0x0c,
    errPOR = 0x0d,
    errUNKNOWN = 0x0e,
    errSTALLEDPKT = 0x0f,
}

impl DfuStatus {
    pub fn description(&self) -> &'static str {
        use DfuStatus::*;
        match self {
            OK => "No error condition is present.",
            errTARGET => "File is not targeted for use by this device.",
            errFILE => "File is for this device but fails some vendor-specific verification test.",
            errWRITE => "Device is unable to write memory.",
            errERASE => "Memory erase function failed.",
            errCHECK_ERASED => "Memory erase check failed.",
            errPROG => "Program memory function failed.",
            errVERIFY => "Programmed memory failed verification.",
            errADDRESS => "Cannot program memory due to received address that is out of range.",
            errNOTDONE => {
                "Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet."
            }
            errFIRMWARE => {
                "Device's firmware is corrupt. It cannot return to run-time (non-DFU) operations."
            }
            errVENDOR => "iString indicates a vendor-specific error.",
            errUSBR => "Device detected unexpected USB reset signaling.",
            errPOR => "Device detected unexpected power on reset.",
            errUNKNOWN => "Something went wrong, but the device does not know what it was.",
            errSTALLEDPKT => "Device stalled an unexpected request.",
        }
    }
}

/// States a DFU device can be in, per `bState`.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, TryFromPrimitive)]
#[allow(non_camel_case_types)] // Names from DFU spec
pub enum DfuState {
    appIDLE = 0,
    appDETACH = 1,
    #[default]
    dfuIDLE = 2,
    dfuDNLOAD_SYNC = 3,
    dfuDNBUSY = 4,
    dfuDNLOAD_IDLE = 5,
    dfuMANIFEST_SYNC = 6,
    dfuMANIFEST = 7,
    dfuMANIFEST_WAIT_RESET = 8,
    dfuUPLOAD_IDLE = 9,
    dfuERROR = 10,
}

impl DfuState {
    pub fn ensure(self, expected: DfuState) -> Result<(), StateError> {
        if self != expected {
            Err(StateError::Unexpected {
                expected,
                actual: self,
            })
        } else {
            Ok(())
        }
    }
}

/// Decoded 6-byte reply to `DFU_GETSTATUS` (spec §4.1).
#[derive(Copy, Clone, Debug)]
pub struct DfuStatusResult {
    pub status: DfuStatus,
    /// Milliseconds the host must wait before its next request.
    pub poll_timeout: u32,
    pub state: DfuState,
}

impl DfuStatusResult {
    /// `bwPollTimeout` is the little-endian 24-bit field at offsets 1..=3.
    pub fn parse(reply: &[u8]) -> Result<Self, Error> {
        if reply.len() < 6 {
            return Err(Error::ProtocolError(format!(
                "GETSTATUS reply too short: expected 6 bytes, got {}",
                reply.len()
            )));
        }

        let status = DfuStatus::try_from(reply[0])
            .map_err(|e| Error::ProtocolError(format!("unknown bStatus {}", e.number)))?;
        let poll_timeout = LE::read_u24(&reply[1..4]);
        let state = DfuState::try_from(reply[4])
            .map_err(|e| Error::ProtocolError(format!("unknown bState {}", e.number)))?;

        Ok(Self {
            status,
            poll_timeout,
            state,
        })
    }

    pub fn ensure_ok(&self) -> Result<(), Error> {
        if self.status != DfuStatus::OK {
            Err(Error::DeviceStatusError {
                status: self.status,
            })
        } else {
            Ok(())
        }
    }

    pub fn ensure_state(&self, expected: DfuState) -> Result<(), Error> {
        self.state.ensure(expected).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_reply() {
        // status=OK, poll=0x000a00 (2560ms), state=dfuDNLOAD_IDLE, iString=0
        let reply = [0x00, 0x00, 0x0a, 0x00, 0x05, 0x00];
        let result = DfuStatusResult::parse(&reply).unwrap();
        assert_eq!(result.status, DfuStatus::OK);
        assert_eq!(result.poll_timeout, 0x000a00);
        assert_eq!(result.state, DfuState::dfuDNLOAD_IDLE);
        result.ensure_ok().unwrap();
        result.ensure_state(DfuState::dfuDNLOAD_IDLE).unwrap();
    }

    #[test]
    fn rejects_short_reply() {
        assert!(DfuStatusResult::parse(&[0, 0, 0]).is_err());
    }

    #[test]
    fn ensure_state_reports_mismatch() {
        let reply = [0x00, 0x00, 0x00, 0x00, 0x02, 0x00]; // dfuIDLE
        let result = DfuStatusResult::parse(&reply).unwrap();
        assert!(result.ensure_state(DfuState::dfuDNLOAD_IDLE).is_err());
    }
}
