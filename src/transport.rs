//! USB transport adapter: enumeration, control transfers and interface
//! claiming, abstracted behind [`UsbTransport`] so the protocol layers never
//! touch `rusb` directly. [`RusbTransport`] is the only implementor used in
//! production; tests substitute [`crate::transport::mock::MockTransport`].

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

use crate::descriptor::USB_DT_DFU;
use crate::error::Error;
use crate::quirks::QuirkFlags;

/// Fixed control-transfer timeout for every DFU class request (spec §4.1).
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

const LIBUSB_CLASS_APPLICATION_SPECIFIC: u8 = 0xfe;
const DFU_SUBCLASS: u8 = 0x01;
const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
const DFU_PROTOCOL_DFU_MODE: u8 = 0x02;

bitflags! {
    /// Which fields of a [`DeviceInterface`] are active filter constraints
    /// versus merely discovered values. Generalizes dfu-util's `DFU_IFF_*`
    /// flags (`dfu_util.h`).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MatchFlags: u16 {
        const VENDOR        = 0x0001;
        const PRODUCT       = 0x0002;
        const VENDOR_DFU    = 0x0004;
        const PRODUCT_DFU   = 0x0008;
        const CONFIG        = 0x0010;
        const IFACE         = 0x0020;
        const ALT           = 0x0040;
        const DEVNUM        = 0x0080;
        const PATH          = 0x0100;
        /// Interface is currently in DFU mode (bInterfaceProtocol == 2).
        const DFU_MODE      = 0x0200;
    }
}

/// CLI-supplied constraints used to pick one interface out of enumeration
/// (spec §3 "DeviceInterface ... constructed from CLI filters").
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub vendor: Option<u16>,
    pub product: Option<u16>,
    pub vendor_dfu: Option<u16>,
    pub product_dfu: Option<u16>,
    pub bus_devnum: Option<(u8, u8)>,
    pub configuration: Option<u8>,
    pub interface: Option<u8>,
    pub altsetting: Option<u8>,
    pub serial: Option<String>,
    pub serial_dfu: Option<String>,
    /// Only match interfaces already in DFU mode.
    pub require_dfu_mode: bool,
}

impl DeviceFilter {
    /// Parse a `vendor:product[,vendor_dfu:product_dfu]` string as accepted
    /// by `--device` (spec §6), mirroring dfu-util's `parse_vendprod`.
    pub fn parse_vendprod(spec: &str) -> Result<Self, Error> {
        let mut filter = DeviceFilter::default();

        let (runtime, dfu) = match spec.split_once(',') {
            Some((a, b)) => (a, Some(b)),
            None => (spec, None),
        };

        let (vendor, product) = Self::parse_one_vendprod(runtime)?;
        filter.vendor = vendor;
        filter.product = product;
        filter.vendor_dfu = vendor;
        filter.product_dfu = product;

        if let Some(dfu) = dfu {
            let (vendor_dfu, product_dfu) = Self::parse_one_vendprod(dfu)?;
            filter.vendor_dfu = vendor_dfu;
            filter.product_dfu = product_dfu;
        }

        Ok(filter)
    }

    fn parse_one_vendprod(s: &str) -> Result<(Option<u16>, Option<u16>), Error> {
        let (vendor, rest) = match s.split_once(':') {
            Some((v, r)) => (v, Some(r)),
            None => (s, None),
        };

        let vendor = if vendor.is_empty() {
            None
        } else {
            Some(u16::from_str_radix(vendor, 16).map_err(|_| {
                Error::UsageError(format!("invalid vendor ID: {vendor}"))
            })?)
        };
        let product = match rest {
            None | Some("") => None,
            Some(p) => Some(
                u16::from_str_radix(p, 16)
                    .map_err(|_| Error::UsageError(format!("invalid product ID: {p}")))?,
            ),
        };

        Ok((vendor, product))
    }

    fn matches(&self, candidate: &DeviceInterface) -> bool {
        if self.require_dfu_mode != candidate.is_dfu_mode {
            // require_dfu_mode=false also accepts DFU-mode interfaces during
            // the initial "find anything DFU-capable" scan; only filter
            // when the caller explicitly wants DFU-mode interfaces only.
            if self.require_dfu_mode {
                return false;
            }
        }

        let (vendor_filter, product_filter, serial_filter) = if candidate.is_dfu_mode {
            (self.vendor_dfu, self.product_dfu, self.serial_dfu.as_deref())
        } else {
            (self.vendor, self.product, self.serial.as_deref())
        };

        if let Some(v) = vendor_filter {
            if candidate.vendor != v {
                return false;
            }
        }
        if let Some(p) = product_filter {
            if candidate.product != p {
                return false;
            }
        }
        if let Some((bus, devnum)) = self.bus_devnum {
            if candidate.bus != bus || candidate.address != devnum {
                return false;
            }
        }
        if let Some(cfg) = self.configuration {
            if candidate.configuration != cfg {
                return false;
            }
        }
        if let Some(intf) = self.interface {
            if candidate.interface != intf {
                return false;
            }
        }
        if let Some(alt) = self.altsetting {
            if candidate.altsetting != alt {
                return false;
            }
        }
        if let Some(serial) = serial_filter {
            if candidate.serial.as_deref() != Some(serial) {
                return false;
            }
        }

        true
    }
}

/// One DFU-capable interface/altsetting found on the bus (spec §3).
#[derive(Debug, Clone)]
pub struct DeviceInterface {
    pub bus: u8,
    pub address: u8,
    pub vendor: u16,
    pub product: u16,
    /// Same as `vendor`/`product` unless the device changes identity on
    /// detach, in which case these hold the DFU-mode pair once known.
    pub vendor_dfu: u16,
    pub product_dfu: u16,
    pub bcd_device: u16,
    pub configuration: u8,
    pub interface: u8,
    pub altsetting: u8,
    pub alt_name: Option<String>,
    pub serial: Option<String>,
    pub serial_dfu: Option<String>,
    pub is_dfu_mode: bool,
    pub quirks: QuirkFlags,
}

impl fmt::Display for DeviceInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: [{:04x}:{:04x}] ver={:04x}, devnum={}, cfg={}, intf={}, alt={}, name=\"{}\", serial=\"{}\"",
            if self.is_dfu_mode { "DFU" } else { "Runtime" },
            if self.is_dfu_mode { self.vendor_dfu } else { self.vendor },
            if self.is_dfu_mode { self.product_dfu } else { self.product },
            self.bcd_device,
            self.address,
            self.configuration,
            self.interface,
            self.altsetting,
            self.alt_name.as_deref().unwrap_or("UNDEFINED"),
            self.serial.as_deref().unwrap_or("UNDEFINED"),
        )
    }
}

/// Control transfers and interface lifecycle, abstracted away from `rusb`.
///
/// All methods carry the fixed 5-second DFU timeout; callers never pass one.
pub trait UsbTransport {
    fn control_write(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize, Error>;

    fn control_read(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> Result<usize, Error>;

    fn claim_interface(&self, interface: u8) -> Result<(), Error>;
    fn release_interface(&self, interface: u8) -> Result<(), Error>;
    fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<(), Error>;

    /// Bus reset, used after manifestation when `will-detach` is unset.
    fn reset(&self) -> Result<(), Error>;

    fn max_packet_size_0(&self) -> u16;
}

/// RAII scoped interface claim (REDESIGN FLAG: "ownership of transport
/// handle"). Releases on every exit path, including `?` early-return.
pub struct ClaimedInterface<'a, T: UsbTransport> {
    transport: &'a T,
    interface: u8,
}

impl<'a, T: UsbTransport> ClaimedInterface<'a, T> {
    pub fn claim(transport: &'a T, interface: u8) -> Result<Self, Error> {
        transport.claim_interface(interface)?;
        Ok(Self {
            transport,
            interface,
        })
    }

    pub fn transport(&self) -> &'a T {
        self.transport
    }
}

impl<'a, T: UsbTransport> Drop for ClaimedInterface<'a, T> {
    fn drop(&mut self) {
        let _ = self.transport.release_interface(self.interface);
    }
}

pub mod rusb_transport {
    use super::*;
    use rusb::{GlobalContext, UsbContext};

    pub type Device = rusb::Device<GlobalContext>;

    /// Production [`UsbTransport`] backed by `rusb`/libusb.
    pub struct RusbTransport {
        handle: rusb::DeviceHandle<GlobalContext>,
        max_packet_size_0: u16,
    }

    impl RusbTransport {
        pub fn open(device: &Device) -> Result<Self, Error> {
            let handle = device
                .open()
                .map_err(|e| Error::transport("opening device", e))?;
            let max_packet_size_0 = device
                .device_descriptor()
                .map_err(|e| Error::transport("reading device descriptor", e))?
                .max_packet_size_0() as u16;

            Ok(Self {
                handle,
                max_packet_size_0,
            })
        }

        pub fn handle(&self) -> &rusb::DeviceHandle<GlobalContext> {
            &self.handle
        }

        /// Fetch the 9-byte DFU functional descriptor from the interface's
        /// cached extra descriptors, falling back to a direct
        /// `GET_DESCRIPTOR` request (spec §6).
        pub fn dfu_functional_descriptor(
            &self,
            configuration: u8,
            interface: u8,
        ) -> Result<Option<Vec<u8>>, Error> {
            let device = self.handle.device();
            let desc = device
                .device_descriptor()
                .map_err(|e| Error::transport("reading device descriptor", e))?;

            for cfg_idx in 0..desc.num_configurations() {
                let config = match device.config_descriptor(cfg_idx) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                if config.number() != configuration {
                    continue;
                }

                for iface in config.interfaces() {
                    if iface.number() != interface {
                        continue;
                    }
                    for alt in iface.descriptors() {
                        if let Some(extra) = alt.extra() {
                            if let Some(found) = find_descriptor(extra, USB_DT_DFU) {
                                return Ok(Some(found));
                            }
                        }
                    }
                }
            }

            // Not cached: ask the device directly.
            let mut buf = [0u8; 9];
            match self.handle.read_control(
                rusb::request_type(
                    rusb::Direction::In,
                    rusb::RequestType::Standard,
                    rusb::Recipient::Interface,
                ),
                0x06, // GET_DESCRIPTOR
                (USB_DT_DFU as u16) << 8,
                interface as u16,
                &mut buf,
                CONTROL_TIMEOUT,
            ) {
                Ok(n) if n >= 7 => Ok(Some(buf[2..n].to_vec())),
                _ => Ok(None),
            }
        }

        /// Walk every bus, configuration, interface and altsetting for DFU
        /// (class 0xfe, subclass 0x01) interfaces, applying `filter`.
        /// Generalizes `find_dfu_if`'s callback style (dfu_util.c) into an
        /// iterator/filter composition (REDESIGN FLAG 1).
        pub fn enumerate(filter: &DeviceFilter) -> Result<Vec<DeviceInterface>, Error> {
            let devices = rusb::devices().map_err(|e| Error::transport("listing USB devices", e))?;

            let mut found = Vec::new();
            for device in devices.iter() {
                let desc = match device.device_descriptor() {
                    Ok(d) => d,
                    Err(_) => continue,
                };

                for cfg_idx in 0..desc.num_configurations() {
                    let config = match device.config_descriptor(cfg_idx) {
                        Ok(c) => c,
                        Err(_) => continue,
                    };

                    for iface in config.interfaces() {
                        for alt in iface.descriptors() {
                            if alt.class_code() != LIBUSB_CLASS_APPLICATION_SPECIFIC
                                || alt.sub_class_code() != DFU_SUBCLASS
                            {
                                continue;
                            }

                            let is_dfu_mode = alt.protocol_code() == DFU_PROTOCOL_DFU_MODE;
                            if !is_dfu_mode && alt.protocol_code() != DFU_PROTOCOL_RUNTIME {
                                continue;
                            }

                            let candidate = DeviceInterface {
                                bus: device.bus_number(),
                                address: device.address(),
                                vendor: desc.vendor_id(),
                                product: desc.product_id(),
                                vendor_dfu: desc.vendor_id(),
                                product_dfu: desc.product_id(),
                                bcd_device: bcd_u16(desc.device_version()),
                                configuration: config.number(),
                                interface: alt.interface_number(),
                                altsetting: alt.setting_number(),
                                alt_name: None,
                                serial: None,
                                serial_dfu: None,
                                is_dfu_mode,
                                quirks: crate::quirks::lookup(
                                    desc.vendor_id(),
                                    desc.product_id(),
                                    bcd_u16(desc.device_version()),
                                ),
                            };

                            if filter.matches(&candidate) {
                                found.push(candidate);
                            }
                        }
                    }
                }
            }

            Ok(found)
        }
    }

    impl UsbTransport for RusbTransport {
        fn control_write(
            &self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            data: &[u8],
        ) -> Result<usize, Error> {
            self.handle
                .write_control(request_type, request, value, index, data, CONTROL_TIMEOUT)
                .map_err(|e| Error::transport("sending control transfer", e))
        }

        fn control_read(
            &self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            data: &mut [u8],
        ) -> Result<usize, Error> {
            self.handle
                .read_control(request_type, request, value, index, data, CONTROL_TIMEOUT)
                .map_err(|e| Error::transport("receiving control transfer", e))
        }

        fn claim_interface(&self, interface: u8) -> Result<(), Error> {
            self.handle
                .claim_interface(interface)
                .map_err(|e| Error::transport("claiming interface", e))
        }

        fn release_interface(&self, interface: u8) -> Result<(), Error> {
            self.handle
                .release_interface(interface)
                .map_err(|e| Error::transport("releasing interface", e))
        }

        fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<(), Error> {
            self.handle
                .set_alternate_setting(interface, setting)
                .map_err(|e| Error::transport("setting alternate setting", e))
        }

        fn reset(&self) -> Result<(), Error> {
            self.handle
                .reset()
                .map_err(|e| Error::transport("resetting device", e))
        }

        fn max_packet_size_0(&self) -> u16 {
            self.max_packet_size_0
        }
    }

    /// Repack a decoded `rusb::Version` back into the raw packed-BCD
    /// `bcdDevice` value descriptors carry on the wire.
    fn bcd_u16(v: rusb::Version) -> u16 {
        ((v.major() as u16) << 8) | ((v.minor() as u16) << 4) | (v.sub_minor() as u16)
    }

    /// Look for a descriptor in a concatenated descriptor list (dfu-util's
    /// `find_descriptor`, `dfu_util.c`).
    fn find_descriptor(desc_list: &[u8], desc_type: u8) -> Option<Vec<u8>> {
        let mut p = 0;
        while p + 1 < desc_list.len() {
            let len = desc_list[p] as usize;
            if len == 0 {
                return None;
            }
            if desc_list[p + 1] == desc_type {
                let end = (p + len).min(desc_list.len());
                return Some(desc_list[p..end].to_vec());
            }
            p += len;
        }
        None
    }
}

pub use rusb_transport::{Device, RusbTransport};

/// Re-walk the bus to find the `rusb::Device` behind a previously
/// enumerated [`DeviceInterface`], matched by bus number and device
/// address. [`DeviceInterface`] itself stays a plain data struct (cheap to
/// filter, display, and pass around); only opening a transport needs the
/// underlying handle.
pub fn resolve_device(target: &DeviceInterface) -> Result<Device, Error> {
    let devices = rusb::devices().map_err(|e| Error::transport("listing USB devices", e))?;
    devices
        .iter()
        .find(|d| d.bus_number() == target.bus && d.address() == target.address)
        .ok_or_else(|| {
            Error::ProtocolError(format!(
                "device at bus {} address {} is no longer present",
                target.bus, target.address
            ))
        })
}

#[cfg(test)]
pub mod mock;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_vendprod_both_pairs() {
        let f = DeviceFilter::parse_vendprod("1d50:6089,0483:df11").unwrap();
        assert_eq!(f.vendor, Some(0x1d50));
        assert_eq!(f.product, Some(0x6089));
        assert_eq!(f.vendor_dfu, Some(0x0483));
        assert_eq!(f.product_dfu, Some(0xdf11));
    }

    #[test]
    fn parse_vendprod_runtime_only_copies_to_dfu() {
        let f = DeviceFilter::parse_vendprod("1d50:6089").unwrap();
        assert_eq!(f.vendor_dfu, Some(0x1d50));
        assert_eq!(f.product_dfu, Some(0x6089));
    }

    #[test]
    fn parse_vendprod_vendor_only() {
        let f = DeviceFilter::parse_vendprod("1d50").unwrap();
        assert_eq!(f.vendor, Some(0x1d50));
        assert_eq!(f.product, None);
    }

    #[test]
    fn parse_vendprod_rejects_garbage() {
        assert!(DeviceFilter::parse_vendprod("zzzz").is_err());
    }
}
