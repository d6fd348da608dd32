//! `dfu-suffix`: add, check, or remove the DFU suffix (and optional TI
//! Stellaris prefix) on a firmware file.
//!
//! Option set grounded on dfu-util's `suffix.c`; CLI plumbing follows the
//! same `clap` derive idiom as `dfu-util.rs`.

use std::path::PathBuf;

use clap::Parser;
use dfu_util_rs::error::Error;
use dfu_util_rs::file_format::{self, SuffixInfo};

/// Add, check, or remove a DFU suffix on a firmware file.
#[derive(Parser, Debug)]
#[command(name = "dfu-suffix", version)]
struct Opt {
    /// Check that FILE has a valid DFU suffix and print its contents.
    #[arg(long)]
    check: bool,

    /// Add a DFU suffix to FILE.
    #[arg(long)]
    add: bool,

    /// Remove the DFU suffix (and, with --stellaris, the Stellaris prefix)
    /// from FILE.
    #[arg(long)]
    delete: bool,

    /// Product ID to store in the suffix (hex). Defaults to 0xffff
    /// ("don't care").
    #[arg(long, value_name = "HEX")]
    pid: Option<String>,

    /// Vendor ID to store in the suffix (hex). Defaults to 0xffff.
    #[arg(long, value_name = "HEX")]
    vid: Option<String>,

    /// Device ID (bcdDevice) to store in the suffix (hex). Defaults to
    /// 0xffff.
    #[arg(long, value_name = "HEX")]
    did: Option<String>,

    /// Prepend a TI Stellaris prefix targeting flash address ADDR (hex),
    /// when adding a suffix.
    #[arg(long, value_name = "ADDR")]
    stellaris_address: Option<String>,

    /// When deleting, also strip a leading Stellaris prefix if present.
    #[arg(long)]
    stellaris: bool,

    /// The firmware file to operate on.
    file: PathBuf,
}

fn parse_hex_u16(s: &str, what: &str) -> Result<u16, Error> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|_| Error::UsageError(format!("invalid {what} \"{s}\"")))
}

fn parse_hex_u32(s: &str, what: &str) -> Result<u32, Error> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|_| Error::UsageError(format!("invalid {what} \"{s}\"")))
}

fn run(opt: &Opt) -> Result<(), Error> {
    let mode_count = [opt.check, opt.add, opt.delete].iter().filter(|b| **b).count();
    if mode_count != 1 {
        return Err(Error::UsageError(
            "exactly one of --check, --add, or --delete is required".into(),
        ));
    }

    if opt.check {
        return check(opt);
    }
    if opt.add {
        return add(opt);
    }
    delete(opt)
}

fn check(opt: &Opt) -> Result<(), Error> {
    let bytes = std::fs::read(&opt.file).map_err(Error::IoError)?;

    if let Some((prefix, _)) = file_format::parse_stellaris_prefix(&bytes) {
        println!(
            "Stellaris prefix: payload {} words, flash address 0x{:08x}",
            prefix.payload_words, prefix.flash_address
        );
    }

    let (_, suffix) = file_format::parse_suffix(&bytes)?;
    print_suffix(&suffix);
    println!("Suffix CRC matches file contents");
    Ok(())
}

fn add(opt: &Opt) -> Result<(), Error> {
    let mut payload = std::fs::read(&opt.file).map_err(Error::IoError)?;

    if let Some(addr) = &opt.stellaris_address {
        let flash_address = parse_hex_u32(addr, "--stellaris-address")?;
        let prefix = file_format::build_stellaris_prefix(&payload, flash_address)?;
        let mut with_prefix = Vec::with_capacity(prefix.len() + payload.len());
        with_prefix.extend_from_slice(&prefix);
        with_prefix.append(&mut payload);
        payload = with_prefix;
    }

    let bcd_device = optional_id(&opt.did, "--did")?;
    let id_product = optional_id(&opt.pid, "--pid")?;
    let id_vendor = optional_id(&opt.vid, "--vid")?;

    let suffix = SuffixInfo {
        bcd_device,
        id_product,
        id_vendor,
        bcd_dfu: 0x0100,
        crc: 0,
    };
    let file = file_format::append_suffix(&payload, suffix);
    std::fs::write(&opt.file, &file).map_err(Error::IoError)?;

    log::info!("added suffix: new file is {} bytes", file.len());
    Ok(())
}

fn delete(opt: &Opt) -> Result<(), Error> {
    let bytes = std::fs::read(&opt.file).map_err(Error::IoError)?;
    let (body, _) = file_format::parse_suffix(&bytes)?;

    let body = if opt.stellaris {
        match file_format::parse_stellaris_prefix(body) {
            Some((_, rest)) => rest,
            None => body,
        }
    } else {
        body
    };

    std::fs::write(&opt.file, body).map_err(Error::IoError)?;
    log::info!("removed suffix: new file is {} bytes", body.len());
    Ok(())
}

fn optional_id(raw: &Option<String>, flag: &str) -> Result<file_format::OptionalId, Error> {
    match raw {
        None => Ok(file_format::OptionalId::Any),
        Some(s) => Ok(file_format::OptionalId::Id(parse_hex_u16(s, flag)?)),
    }
}

fn print_suffix(suffix: &SuffixInfo) {
    println!("DFU suffix version: {:#06x}", suffix.bcd_dfu);
    print_optional("idVendor", suffix.id_vendor);
    print_optional("idProduct", suffix.id_product);
    print_optional("bcdDevice", suffix.bcd_device);
}

fn print_optional(name: &str, value: file_format::OptionalId) {
    match value {
        file_format::OptionalId::Any => println!("{name}: 0xffff (any)"),
        file_format::OptionalId::Id(id) => println!("{name}: {id:#06x}"),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let opt = Opt::parse();

    if let Err(e) = run(&opt) {
        log::error!("{e}");
        std::process::exit(e.exit_code());
    }
}
