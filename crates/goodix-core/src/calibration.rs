//! Per-unit calibration derived from OTP fuse data, and config blob patching.
//!
//! The sensor ships a firmware configuration blob whose tuning entries must
//! be overwritten with values derived from the unit's one-time-programmable
//! fuses before upload. The blob carries a trailing 16-bit checksum that the
//! firmware verifies; every patch must be followed by a checksum fix or the
//! upload is silently rejected.

use thiserror::Error;
use tracing::debug;

use crate::protocol::constants::{DAC_L_TAG, DELTA_DOWN_TAG, FDT_BASE_LEN, TCODE_TAG};

/// OTP byte offsets consumed by the derivation.
const OTP_DIFF_OFFSET: usize = 17;
const OTP_DAC_OFFSET: usize = 22;
const OTP_TCODE_OFFSET: usize = 23;
const OTP_DAC_L_OFFSET: usize = 31;

/// Minimum OTP length covering all consumed offsets.
const OTP_MIN_LEN: usize = 32;

/// Checksum seed for the config blob.
const CONFIG_CHECKSUM_BASE: u32 = 0xA5A5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("OTP data too short: need {needed} bytes, got {got}")]
    OtpTooShort { needed: usize, got: usize },

    #[error("config blob too short: need {needed} bytes, got {got}")]
    ConfigTooShort { needed: usize, got: usize },
}

/// Tuning parameters derived once from OTP fuse data at device init.
/// Immutable afterward; read-only for all config patching of that session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationParams {
    pub tcode: u16,
    pub dac_h: u16,
    pub dac_l: u16,
    /// `0xC83 / tcode`; absent for a blank sensor where `tcode == 0`.
    /// The vendor code divides unconditionally, which is a division by
    /// zero on blank parts.
    pub dac_delta: Option<u16>,
    pub delta_fdt: u8,
    pub delta_down: u8,
    pub delta_up: u8,
    pub delta_img: u8,
    pub delta_nav: u8,
    pub fdt_base_down: [u8; FDT_BASE_LEN],
    pub fdt_base_up: [u8; FDT_BASE_LEN],
    pub fdt_base_manual: [u8; FDT_BASE_LEN],
}

impl CalibrationParams {
    /// Derive tuning parameters from raw OTP fuse bytes.
    pub fn derive(otp: &[u8]) -> Result<Self, CalibrationError> {
        if otp.len() < OTP_MIN_LEN {
            return Err(CalibrationError::OtpTooShort {
                needed: OTP_MIN_LEN,
                got: otp.len(),
            });
        }

        let diff = (otp[OTP_DIFF_OFFSET] >> 1) & 0x1F;
        let tcode = if otp[OTP_TCODE_OFFSET] != 0 {
            otp[OTP_TCODE_OFFSET] as u16 + 1
        } else {
            0
        };

        let mut dac_h = ((otp[OTP_DIFF_OFFSET] as u16) << 8 ^ otp[OTP_DAC_OFFSET] as u16) & 0x1FF;
        let mut dac_l = ((otp[OTP_DIFF_OFFSET] as u16 & 0x40) << 2) ^ otp[OTP_DAC_L_OFFSET] as u16;

        let mut delta_fdt = 0u8;
        let mut delta_down = 0xD_u8;
        let mut delta_up = 0xB_u8;
        let delta_img = 0xC8_u8;
        let mut delta_nav = 0x28_u8;

        if diff != 0 {
            let tmp = diff + 5;
            let tmp2 = ((tmp as u32 * 0x32) >> 4) as u8;
            delta_fdt = tmp2 / 5;
            delta_down = tmp2 / 3;
            delta_up = delta_down - 2;
            delta_nav = tmp * 4;
        }

        if otp[OTP_DIFF_OFFSET] == 0 || otp[OTP_DAC_OFFSET] == 0 || otp[OTP_DAC_L_OFFSET] == 0 {
            // Blank / uncalibrated part.
            dac_h = 0x97;
            dac_l = 0xD0;
        }

        let dac_delta = if tcode != 0 {
            Some(0xC83 / tcode)
        } else {
            None
        };

        debug!(
            tcode = %format!("{tcode:#x}"),
            dac_h = %format!("{dac_h:#x}"),
            dac_l = %format!("{dac_l:#x}"),
            delta_down = %format!("{delta_down:#x}"),
            delta_up = %format!("{delta_up:#x}"),
            delta_nav = %format!("{delta_nav:#x}"),
            "Calibration derived"
        );

        Ok(Self {
            tcode,
            dac_h,
            dac_l,
            dac_delta,
            delta_fdt,
            delta_down,
            delta_up,
            delta_img,
            delta_nav,
            fdt_base_down: [0u8; FDT_BASE_LEN],
            fdt_base_up: [0u8; FDT_BASE_LEN],
            fdt_base_manual: [0u8; FDT_BASE_LEN],
        })
    }
}

/// Sensor configuration blob: a section table, 4-byte tag/value entries,
/// and a trailing 16-bit checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorConfig {
    data: Vec<u8>,
}

impl SensorConfig {
    /// Section table entry size: `table[section + 1]` holds the base
    /// offset, `table[section + 2]` the section size.
    pub fn new(data: Vec<u8>) -> Result<Self, CalibrationError> {
        if data.len() < 4 {
            return Err(CalibrationError::ConfigTooShort {
                needed: 4,
                got: data.len(),
            });
        }
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Overwrite the value of every entry with a matching tag inside one
    /// section. Entries are `(tag: u16 LE, value: u16 LE)` pairs scanned
    /// within `[base, base + size]`.
    pub fn replace_value_in_section(&mut self, section: usize, tag: u16, value: u16) {
        let (Some(&base), Some(&size)) = (self.data.get(section + 1), self.data.get(section + 2))
        else {
            return;
        };
        let base = base as usize;
        let size = size as usize;

        let mut entry = base;
        while entry <= base + size && entry + 4 <= self.data.len() {
            let entry_tag = u16::from_le_bytes([self.data[entry], self.data[entry + 1]]);
            if entry_tag == tag {
                self.data[entry + 2..entry + 4].copy_from_slice(&value.to_le_bytes());
            }
            entry += 4;
        }
    }

    /// Apply the per-unit calibration to the fixed patch table and fix the
    /// trailing checksum.
    pub fn patch(&mut self, params: &CalibrationParams) {
        debug!(tcode = %format!("{:#x}", params.tcode), "Patching config");

        for section in [4, 6, 8] {
            self.replace_value_in_section(section, TCODE_TAG, params.tcode);
        }
        for section in [4, 6] {
            self.replace_value_in_section(section, DAC_L_TAG, params.dac_l << 4 | 8);
        }
        self.replace_value_in_section(4, DELTA_DOWN_TAG, (params.delta_down as u16) << 8 | 0x80);

        self.fix_checksum();
    }

    /// Recompute the trailing checksum: `0xA5A5` plus the sum of all
    /// 16-bit LE words before the trailer, two's-complemented.
    pub fn fix_checksum(&mut self) {
        let mut sum = CONFIG_CHECKSUM_BASE;
        let body_len = self.data.len() - 2;
        for word in self.data[..body_len].chunks_exact(2) {
            sum += u16::from_le_bytes([word[0], word[1]]) as u32;
            sum &= 0xFFFF;
        }
        let checksum = ((0x1_0000 - sum) & 0xFFFF) as u16;
        self.data[body_len..].copy_from_slice(&checksum.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_otp_yields_fallback_dac() {
        let otp = vec![0u8; 32];
        let params = CalibrationParams::derive(&otp).unwrap();
        assert_eq!(params.tcode, 0);
        assert_eq!(params.dac_h, 0x97);
        assert_eq!(params.dac_l, 0xD0);
        // Blank part: the 0xC83 / tcode division would be by zero.
        assert_eq!(params.dac_delta, None);
    }

    #[test]
    fn test_zero_diff_keeps_default_deltas() {
        let mut otp = vec![0u8; 32];
        otp[17] = 0x01; // diff = (0x01 >> 1) & 0x1F = 0
        otp[22] = 0x05;
        otp[23] = 0x02;
        otp[31] = 0x07;

        let params = CalibrationParams::derive(&otp).unwrap();
        assert_eq!(params.delta_fdt, 0);
        assert_eq!(params.delta_down, 0xD);
        assert_eq!(params.delta_up, 0xB);
        assert_eq!(params.delta_img, 0xC8);
        assert_eq!(params.delta_nav, 0x28);

        assert_eq!(params.tcode, 3);
        assert_eq!(params.dac_h, (0x01u16 << 8 ^ 0x05) & 0x1FF);
        assert_eq!(params.dac_l, 0x07);
        assert_eq!(params.dac_delta, Some(0xC83 / 3));
    }

    #[test]
    fn test_nonzero_diff_scales_deltas() {
        let mut otp = vec![0u8; 32];
        otp[17] = 0x0A; // diff = 5
        otp[22] = 0x10;
        otp[23] = 0x08;
        otp[31] = 0x20;

        let params = CalibrationParams::derive(&otp).unwrap();
        // tmp = 10, tmp2 = (10 * 0x32) >> 4 = 31
        assert_eq!(params.delta_fdt, 6);
        assert_eq!(params.delta_down, 10);
        assert_eq!(params.delta_up, 8);
        assert_eq!(params.delta_img, 0xC8);
        assert_eq!(params.delta_nav, 40);
    }

    #[test]
    fn test_otp_too_short() {
        assert_eq!(
            CalibrationParams::derive(&[0u8; 31]).unwrap_err(),
            CalibrationError::OtpTooShort { needed: 32, got: 31 }
        );
    }

    #[test]
    fn test_checksum_of_zero_blob() {
        let mut config = SensorConfig::new(vec![0u8; 16]).unwrap();
        config.fix_checksum();
        // sum = 0xA5A5, checksum = 0x10000 - 0xA5A5 = 0x5A5B
        assert_eq!(&config.as_bytes()[14..], &[0x5B, 0x5A]);
    }

    #[test]
    fn test_checksum_is_idempotent() {
        let mut data = vec![0u8; 32];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i * 7) as u8;
        }
        let mut config = SensorConfig::new(data).unwrap();
        config.fix_checksum();
        let once = config.clone();
        config.fix_checksum();
        assert_eq!(config, once);
    }

    #[test]
    fn test_patch_rewrites_tagged_entry_and_checksum() {
        // Section 4: base = 10, size = 8, containing a TCODE entry at 10.
        let mut data = vec![0u8; 24];
        data[5] = 10; // section 4 base
        data[6] = 8; // section 4 size
        data[10..12].copy_from_slice(&TCODE_TAG.to_le_bytes());

        let mut config = SensorConfig::new(data).unwrap();
        let mut params = CalibrationParams::derive(&[0u8; 32]).unwrap();
        params.tcode = 0x42;
        let before = config.clone();

        config.patch(&params);

        assert_eq!(&config.as_bytes()[12..14], &0x42u16.to_le_bytes());
        assert_ne!(&config.as_bytes()[22..], &before.as_bytes()[22..]);

        // Checksum must hold after the patch.
        let mut verify = config.clone();
        verify.fix_checksum();
        assert_eq!(verify, config);
    }

    #[test]
    fn test_patch_ignores_unrelated_tags() {
        let mut data = vec![0u8; 24];
        data[5] = 10;
        data[6] = 8;
        data[10..12].copy_from_slice(&0x99u16.to_le_bytes());
        data[12..14].copy_from_slice(&0x1234u16.to_le_bytes());

        let mut config = SensorConfig::new(data).unwrap();
        let params = CalibrationParams::derive(&[0u8; 32]).unwrap();
        config.patch(&params);

        assert_eq!(&config.as_bytes()[12..14], &0x1234u16.to_le_bytes());
    }
}
