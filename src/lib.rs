//! Host-side USB DFU (Device Firmware Upgrade) library: the USB DFU 1.1
//! class protocol, ST's DfuSe 1.1a extension, and the DFU file format used
//! by both the `dfu-util` and `dfu-suffix` binaries.

/// Error and result types shared across every layer.
pub mod error;

/// `bStatus`/`bState` codes and the `DFU_GETSTATUS` reply.
pub mod status;

/// The USB DFU functional descriptor (`bmAttributes`, `wTransferSize`, ...).
pub mod descriptor;

/// USB transport adapter: enumeration, control transfers, interface
/// claiming.
pub mod transport;

/// The six DFU class-specific control requests.
pub mod request;

/// Device-specific workaround table.
pub mod quirks;

/// State machine reconciliation and poll-timeout handling shared by every
/// transfer engine.
pub mod state_machine;

/// The generic (non-DfuSe) download/upload engine.
pub mod transfer;

/// DfuSe memory-layout alternate-setting string parser.
pub mod memory_layout;

/// ST DfuSe 1.1a extension: special commands, the address-oriented
/// transfer engine, and the DfuSe file container format.
pub mod dfuse;

/// The mandatory DFU file suffix and optional TI Stellaris prefix.
pub mod file_format;

/// Whole-program operations built from the layers above: enumeration,
/// runtime-to-DFU transition, and engine dispatch.
pub mod orchestrator;
