//! ST DfuSe (DFU 1.1a) extension: address-oriented programming via special
//! commands sent as DNLOAD block 0, and the DfuSe file container format.
//!
//! Grounded on `dfuse.c` in its entirety; `commands` covers
//! `dfuse_special_command`, `transfer` covers `dfuse_dnload_element`/
//! `dfuse_do_upload`, `file` covers `dfuse_do_dfuse_dnload`.

pub mod commands;
pub mod file;
pub mod transfer;

pub use commands::DfuSeContext;
pub use transfer::DfuSeEngine;

use crate::error::Error;

/// Options carried by dfu-util's `--dfuse-address` sub-language (spec §6):
/// `ADDR[:force][:leave][:unprotect][:mass-erase][:LENGTH]`, colon
/// separated, with a leading colon meaning the address is omitted.
#[derive(Debug, Clone, Default)]
pub struct DfuseOptions {
    pub address: Option<u32>,
    /// Authorize `mass-erase`/`unprotect`, both irreversible.
    pub force: bool,
    /// After downloading, jump to firmware instead of staying in DFU mode.
    pub leave: bool,
    pub unprotect: bool,
    pub mass_erase: bool,
    pub length: Option<u32>,
}

impl DfuseOptions {
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let mut opts = DfuseOptions::default();
        let mut tokens = spec.split(':');

        if let Some(addr) = tokens.next() {
            if !addr.is_empty() {
                opts.address = Some(parse_hex_u32(addr)?);
            }
        }

        for token in tokens {
            match token {
                "force" => opts.force = true,
                "leave" => opts.leave = true,
                "unprotect" => opts.unprotect = true,
                "mass-erase" => opts.mass_erase = true,
                "" => {}
                other => {
                    opts.length = Some(parse_hex_u32(other).map_err(|_| {
                        Error::UsageError(format!("invalid DfuSe option \"{other}\""))
                    })?);
                }
            }
        }

        Ok(opts)
    }
}

/// Parse a number the way dfu-util's `strtoul(s, NULL, 0)` calls do: a
/// `0x`/`0X` prefix selects hex, otherwise the value is decimal.
fn parse_hex_u32(s: &str) -> Result<u32, Error> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|_| Error::UsageError(format!("invalid number \"{s}\"")))
}

#[cfg(test)]
mod options_tests {
    use super::*;

    #[test]
    fn parses_address_only() {
        let opts = DfuseOptions::parse("0x08000000").unwrap();
        assert_eq!(opts.address, Some(0x0800_0000));
        assert!(!opts.force);
        assert!(!opts.leave);
    }

    #[test]
    fn parses_all_flags() {
        let opts = DfuseOptions::parse("0x08000000:force:leave:unprotect:mass-erase:1000").unwrap();
        assert_eq!(opts.address, Some(0x0800_0000));
        assert!(opts.force);
        assert!(opts.leave);
        assert!(opts.unprotect);
        assert!(opts.mass_erase);
        assert_eq!(opts.length, Some(1000));
    }

    #[test]
    fn leading_colon_omits_address() {
        let opts = DfuseOptions::parse(":force:leave").unwrap();
        assert_eq!(opts.address, None);
        assert!(opts.force);
        assert!(opts.leave);
    }
}
