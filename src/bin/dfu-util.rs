//! `dfu-util`: list, download to, and upload from USB DFU/DfuSe devices.
//!
//! Option set and exit-code convention grounded on dfu-util's `main.c`;
//! CLI plumbing follows the teacher's `main.rs`, moved from `structopt`
//! (stale relative to the teacher's own `Cargo.toml`) onto `clap` derive,
//! which is what that manifest actually declares.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use dfu_util_rs::dfuse::DfuseOptions;
use dfu_util_rs::error::Error;
use dfu_util_rs::file_format::FileImage;
use dfu_util_rs::orchestrator;
use dfu_util_rs::transport::{DeviceFilter, RusbTransport};

/// USB DFU 1.0/1.1 and ST DfuSe 1.1a firmware update utility.
#[derive(Parser, Debug)]
#[command(name = "dfu-util", version)]
struct Opt {
    /// List currently attached DFU-capable devices.
    #[arg(short = 'l', long)]
    list: bool,

    /// Detach a runtime-mode device into DFU mode and exit, without
    /// downloading or uploading anything.
    #[arg(long)]
    detach: bool,

    /// Print messages at increasing levels of detail (stackable).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Select device by `vendor:product[,vendor_dfu:product_dfu]` (hex).
    #[arg(short = 'd', long, value_name = "VID:PID[,VID:PID]")]
    device: Option<String>,

    /// Select device by bus number and device address, `bus-devnum`.
    #[arg(short = 'p', long, value_name = "BUS-DEVNUM")]
    path: Option<String>,

    /// Specify the bConfigurationValue of the configuration to use.
    #[arg(short = 'c', long)]
    cfg: Option<u8>,

    /// Specify the bInterfaceNumber of the DFU interface to use.
    #[arg(short = 'i', long, default_value_t = 0)]
    intf: u8,

    /// Specify the bAlternateSetting of the DFU interface to use.
    #[arg(short = 'a', long, default_value_t = 0)]
    alt: u8,

    /// Select device by iSerialNumber, in either mode.
    #[arg(short = 'S', long)]
    serial: Option<String>,

    /// Specify the number of bytes per control transfer.
    #[arg(short = 't', long)]
    transfer_size: Option<u32>,

    /// DfuSe target address and options:
    /// `ADDR[:force][:leave][:unprotect][:mass-erase][:LENGTH]`. Required
    /// to download a plain binary to a DfuSe device, or to upload from one.
    #[arg(short = 's', long, value_name = "ADDR[:opt...]")]
    dfuse_address: Option<String>,

    /// Number of bytes to upload; required for generic (non-DfuSe) uploads
    /// without a known end-of-image marker if the device never reports a
    /// short final block.
    #[arg(long, value_name = "BYTES")]
    upload_size: Option<u32>,

    /// Write firmware from FILE to the device.
    #[arg(short = 'D', long, value_name = "FILE")]
    download: Option<PathBuf>,

    /// Read firmware from the device into FILE.
    #[arg(short = 'U', long, value_name = "FILE")]
    upload: Option<PathBuf>,

    /// Issue a USB bus reset after the final operation.
    #[arg(short = 'R', long)]
    reset: bool,

    /// Seconds to wait for the device to reappear after detaching.
    #[arg(long, default_value_t = 5)]
    detach_delay: u64,
}

fn run(opt: &Opt) -> Result<(), Error> {
    let mut filter = match &opt.device {
        Some(spec) => DeviceFilter::parse_vendprod(spec)?,
        None => DeviceFilter::default(),
    };
    filter.configuration = opt.cfg;
    filter.interface = Some(opt.intf);
    filter.altsetting = Some(opt.alt);
    filter.serial = opt.serial.clone();
    filter.serial_dfu = opt.serial.clone();

    if let Some(path) = &opt.path {
        let (bus, devnum) = path
            .split_once('-')
            .and_then(|(b, d)| Some((b.parse().ok()?, d.parse().ok()?)))
            .ok_or_else(|| Error::UsageError(format!("invalid --path \"{path}\"")))?;
        filter.bus_devnum = Some((bus, devnum));
    }

    if opt.list {
        let mut any_filter = filter.clone();
        any_filter.require_dfu_mode = false;
        for device in RusbTransport::enumerate(&any_filter)? {
            println!("{device}");
        }
        return Ok(());
    }

    let dfuse = match &opt.dfuse_address {
        Some(spec) => DfuseOptions::parse(spec)?,
        None => DfuseOptions::default(),
    };

    let mut target = orchestrator::find_one(&filter)?;
    let mut transport = dfu_util_rs::transport::resolve_device(&target).and_then(RusbTransport::open)?;

    // If the interface came up in runtime mode, detach it and wait for the
    // DFU-mode interface to reappear before opening it for real.
    if orchestrator::open_for_transfer(&transport, &target, opt.transfer_size).is_err() {
        let mut dfu_filter = filter.clone();
        dfu_filter.require_dfu_mode = true;
        target = orchestrator::wait_for_reattach(
            &dfu_filter,
            Duration::from_secs(opt.detach_delay),
        )?;
        transport = dfu_util_rs::transport::resolve_device(&target).and_then(RusbTransport::open)?;
    }

    if opt.detach {
        log::info!("device is already in DFU mode: {target}");
        return Ok(());
    }

    let mut opened = orchestrator::open_for_transfer(&transport, &target, opt.transfer_size)?;
    dispatch(&mut opened, opt, &dfuse)
}

fn dispatch(opened: &mut orchestrator::OpenedTarget, opt: &Opt, dfuse: &DfuseOptions) -> Result<(), Error> {
    if dfuse.mass_erase && opt.download.is_none() {
        orchestrator::mass_erase(opened, dfuse.force)?;
    }

    if let Some(path) = &opt.download {
        let bytes = fs::read(path).map_err(Error::IoError)?;
        let image = FileImage::load(&bytes)?;
        let mut printed = 0u64;
        orchestrator::download(
            opened,
            &image.payload,
            image.suffix.bcd_dfu,
            dfuse,
            Some(&mut |sent, total| report_progress(&mut printed, sent, total)),
        )?;
    }

    if let Some(path) = &opt.upload {
        let mut dfuse_with_length = dfuse.clone();
        if dfuse_with_length.length.is_none() {
            dfuse_with_length.length = opt.upload_size;
        }
        let mut printed = 0u64;
        let data = orchestrator::upload(
            opened,
            &dfuse_with_length,
            Some(&mut |got, total| report_progress(&mut printed, got, total)),
        )?;
        fs::write(path, &data).map_err(Error::IoError)?;
    }

    if opt.reset {
        opened.claimed.transport().reset()?;
    }

    Ok(())
}

fn report_progress(printed: &mut u64, done: u64, total: Option<u64>) {
    if done - *printed >= 4096 || Some(done) == total {
        *printed = done;
        match total {
            Some(total) => log::info!("{done}/{total} bytes"),
            None => log::info!("{done} bytes"),
        }
    }
}

fn main() {
    let opt = Opt::parse();
    let level = match opt.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(&opt) {
        log::error!("{e}");
        std::process::exit(e.exit_code());
    }
}
