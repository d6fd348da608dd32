//! Ties device discovery, the runtime-to-DFU transition, version detection
//! and engine dispatch together into the handful of whole-program
//! operations the CLIs need. Grounded on the body of dfu-util's `main()`
//! (`main.c`), restructured from one long function into composable steps.

use std::time::Duration;

use crate::descriptor::{DfuFunctionalDescriptor, BCD_DFUSE, BCD_DFU_1_1};
use crate::dfuse::{DfuSeContext, DfuSeEngine, DfuseOptions};
use crate::error::Error;
use crate::memory_layout::{self, MemorySegment};
use crate::quirks::QuirkFlags;
use crate::state_machine;
use crate::transfer::{GenericEngine, TransferContext};
use crate::transport::{ClaimedInterface, DeviceFilter, DeviceInterface, RusbTransport};

/// Everything learned about a target after opening it and reading its
/// descriptor, kept together instead of threading six parameters through
/// every downstream call.
pub struct OpenedTarget<'a> {
    pub interface_info: DeviceInterface,
    pub claimed: ClaimedInterface<'a, RusbTransport>,
    pub descriptor: DfuFunctionalDescriptor,
    pub block_size: u32,
    pub memory_layout: Vec<MemorySegment>,
}

/// Find the single interface matching `filter`, erroring if none or more
/// than one candidate remains (dfu-util requires `--device`/`--path` to
/// disambiguate when several are present).
pub fn find_one(filter: &DeviceFilter) -> Result<DeviceInterface, Error> {
    let mut matches = RusbTransport::enumerate(filter)?;
    match matches.len() {
        0 => Err(Error::UsageError("no matching DFU-capable interface found".into())),
        1 => Ok(matches.remove(0)),
        n => Err(Error::UsageError(format!(
            "{n} DFU-capable interfaces match; narrow the selection with --device/--path"
        ))),
    }
}

/// Open `target`, claim its interface, switch it to alternate setting
/// `target.altsetting`, and read its functional descriptor. If the
/// interface is still in runtime mode, detach it into DFU mode and
/// re-enumerate first (`main.c`'s `if (!(dif.flags & DFU_IFF_DFU))` path).
pub fn open_for_transfer<'a>(
    transport: &'a RusbTransport,
    target: &DeviceInterface,
    host_transfer_limit: Option<u32>,
) -> Result<OpenedTarget<'a>, Error> {
    let claimed = ClaimedInterface::claim(transport, target.interface)?;
    transport.set_alternate_setting(target.interface, target.altsetting)?;

    let descriptor_bytes = transport
        .dfu_functional_descriptor(target.configuration, target.interface)?
        .ok_or_else(|| Error::ProtocolError("device has no DFU functional descriptor".into()))?;
    let mut descriptor = DfuFunctionalDescriptor::parse(&descriptor_bytes[2..])?;
    if target.quirks.contains(QuirkFlags::FORCE_DFU_1_1) {
        // Spec §5's FORCE_DFU11 quirk: some STM32 clones misreport
        // bcdDFUVersion as plain 1.0; treat them as 1.1 for the purposes of
        // the DfuSe-vs-generic engine dispatch below.
        descriptor.dfu_version = BCD_DFU_1_1;
    }

    if !target.is_dfu_mode {
        state_machine::detach_into_dfu_mode(
            transport,
            target.interface,
            descriptor.detach_timeout_ms,
            descriptor.attributes,
        )?;
        return Err(Error::WrongMode(
            "device detached into DFU mode; re-enumerate and retry".into(),
        ));
    }

    state_machine::ensure_idle(transport, target.interface)?;

    let block_size =
        descriptor.clamp_transfer_size(transport.max_packet_size_0(), host_transfer_limit);

    let memory_layout = match &target.alt_name {
        Some(name) if descriptor.is_dfuse() => memory_layout::parse_memory_layout(name)?,
        _ => Vec::new(),
    };

    Ok(OpenedTarget {
        interface_info: target.clone(),
        claimed,
        descriptor,
        block_size,
        memory_layout,
    })
}

/// Download `image` (with its suffix already stripped, but `file_bcd_dfu`
/// carrying the suffix's `bcdDFU` for the raw/DfuSe-file version check
/// below) to `opened`, dispatching to the generic or DfuSe engine by
/// `bcdDFUVersion` (spec §3). `dfuse` carries `--dfuse-address`'s parsed
/// sub-options; its `address` is required for DfuSe targets whose image is
/// a plain binary rather than a DfuSe container.
pub fn download(
    opened: &mut OpenedTarget,
    image: &[u8],
    file_bcd_dfu: u16,
    dfuse: &DfuseOptions,
    mut progress: Option<&mut dyn FnMut(u64, Option<u64>)>,
) -> Result<(), Error> {
    let transport = opened.claimed.transport();
    let interface = opened.interface_info.interface;

    if opened.descriptor.is_dfuse() {
        let mut engine = DfuSeEngine::new();
        engine.context.force = dfuse.force;

        if dfuse.mass_erase {
            engine.context.mass_erase(transport, interface)?;
        }

        let is_dfuse_file = crate::dfuse::file::is_dfuse_image(image);
        if is_dfuse_file && file_bcd_dfu != BCD_DFUSE {
            return Err(Error::UnsupportedVersion(file_bcd_dfu));
        }
        if !is_dfuse_file && file_bcd_dfu == BCD_DFUSE {
            return Err(Error::UsageError(
                "refusing to send a plain binary whose suffix declares bcdDFU 0x011a; \
                 it looks like a DfuSe container that failed to parse"
                    .into(),
            ));
        }

        let last_element_address = if is_dfuse_file {
            let dfuse_image = crate::dfuse::file::parse(image)?;
            let mut last_address = None;
            for target in &dfuse_image.targets {
                // Spec §4.5: an image whose bAlternateSetting differs from
                // the selected interface is parsed (above) but not
                // downloaded; its bytes are simply skipped.
                if target.alt_setting != opened.interface_info.altsetting {
                    continue;
                }
                for element in &target.elements {
                    engine.download(
                        transport,
                        interface,
                        &opened.memory_layout,
                        element.address,
                        opened.block_size,
                        &element.data,
                        progress.as_deref_mut(),
                    )?;
                    last_address = Some(element.address);
                }
            }
            last_address
        } else {
            let address = dfuse.address.ok_or_else(|| {
                Error::UsageError(
                    "DfuSe devices require --dfuse-address for plain binary images".into(),
                )
            })?;
            engine.download(
                transport,
                interface,
                &opened.memory_layout,
                address,
                opened.block_size,
                image,
                progress.as_deref_mut(),
            )?;
            Some(address)
        };

        if dfuse.unprotect {
            engine.context.read_unprotect(transport, interface)?;
        }

        if dfuse.leave {
            if let Some(address) = last_element_address {
                engine.leave(transport, interface, address)?;
            }
        }

        Ok(())
    } else {
        let mut engine = GenericEngine::new();
        let mut ctx = TransferContext {
            interface,
            block_size: opened.block_size,
            quirks: opened.interface_info.quirks,
            progress,
        };
        engine.download(transport, &mut ctx, image)
    }
}

/// Upload firmware out of `opened`. DfuSe targets require an explicit
/// address (`dfuse.address`); if no length is given, it's computed from the
/// containing segment, falling back to a fixed 0x4000-byte window when the
/// address isn't in any known segment (spec §4.5 upload). Generic targets
/// have no address concept and stop at the first short block or
/// `dfuse.length` if given.
pub fn upload(
    opened: &mut OpenedTarget,
    dfuse: &DfuseOptions,
    mut progress: Option<&mut dyn FnMut(u64, Option<u64>)>,
) -> Result<Vec<u8>, Error> {
    const DEFAULT_UPLOAD_LENGTH: u32 = 0x4000;

    let transport = opened.claimed.transport();
    let interface = opened.interface_info.interface;

    if opened.descriptor.is_dfuse() {
        let address = dfuse
            .address
            .ok_or_else(|| Error::UsageError("DfuSe uploads require --dfuse-address".into()))?;
        let length = match dfuse.length {
            Some(length) => length,
            None => match memory_layout::find_segment(&opened.memory_layout, address) {
                Some(segment) => segment.end().saturating_sub(address),
                None => DEFAULT_UPLOAD_LENGTH,
            },
        };
        let mut engine = DfuSeEngine::new();
        engine.upload(transport, interface, address, length, opened.block_size, progress)
    } else {
        let mut engine = GenericEngine::new();
        let mut ctx = TransferContext {
            interface,
            block_size: opened.block_size,
            quirks: opened.interface_info.quirks,
            progress: progress.take(),
        };
        engine.upload(transport, &mut ctx, dfuse.length.map(u64::from))
    }
}

/// Issue a standalone DfuSe mass-erase, without a subsequent download
/// (dfu-util's `--dfuse-address :mass-erase` with no `--download`).
pub fn mass_erase(opened: &mut OpenedTarget, force: bool) -> Result<(), Error> {
    if !opened.descriptor.is_dfuse() {
        return Err(Error::UsageError(
            "--mass-erase only applies to DfuSe devices".into(),
        ));
    }
    let transport = opened.claimed.transport();
    let interface = opened.interface_info.interface;
    let mut ctx = DfuSeContext::with_force(force);
    ctx.mass_erase(transport, interface)
}

/// Wait up to `timeout` for the device to detach and a new one matching
/// `filter` to appear, used after manifestation when
/// `DfuAttributes::WILL_DETACH` is unset (dfu-util waits for the device to
/// come back rather than assuming the host's bus-reset alone did it).
pub fn wait_for_reattach(filter: &DeviceFilter, timeout: Duration) -> Result<DeviceInterface, Error> {
    let start = std::time::Instant::now();
    loop {
        if let Ok(found) = find_one(filter) {
            return Ok(found);
        }
        if start.elapsed() > timeout {
            return Err(Error::ProtocolError(
                "device did not reappear after manifestation".into(),
            ));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
