//! Hash-derived keys for tables without a natural key.
//!
//! A [`SynthKey`] is created per row, fed every column in source order, and
//! consumed by [`SynthKey::build`]. Each value contributes a canonical byte
//! encoding followed by [`SEPARATOR`]; a NULL contributes the separator only.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Byte written after every column value.
pub const SEPARATOR: u8 = 0x02;

/// Per-row key accumulator.
#[derive(Debug, Clone, Default)]
pub struct SynthKey {
    hasher: Sha256,
}

impl SynthKey {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.hasher.update([SEPARATOR]);
    }

    /// Variable-length values carry a length prefix so that adjacent
    /// columns cannot trade bytes.
    fn update_prefixed(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u32).to_be_bytes());
        self.update(bytes);
    }

    pub fn put_null(&mut self) {
        self.hasher.update([SEPARATOR]);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.update(&[u8::from(v)]);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.update(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.update(&v.to_be_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.update(&v.to_bits().to_be_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.update(&v.to_bits().to_be_bytes());
    }

    /// Scale, then the minimal two's complement bytes of the unscaled value.
    pub fn put_decimal(&mut self, v: &BigDecimal) {
        let (unscaled, scale) = v.as_bigint_and_exponent();
        let digits = unscaled.to_signed_bytes_be();
        let mut bytes = Vec::with_capacity(8 + digits.len());
        bytes.extend_from_slice(&scale.to_be_bytes());
        bytes.extend_from_slice(&digits);
        self.update_prefixed(&bytes);
    }

    pub fn put_str(&mut self, v: &str) {
        self.update_prefixed(v.as_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.update_prefixed(v);
    }

    /// Epoch milliseconds of midnight UTC.
    pub fn put_date(&mut self, v: NaiveDate) {
        let millis = v
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or_default();
        self.update(&millis.to_be_bytes());
    }

    /// Hour, minute, second and nanosecond as four integers.
    pub fn put_time(&mut self, v: NaiveTime) {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&(v.hour() as i32).to_be_bytes());
        bytes[4..8].copy_from_slice(&(v.minute() as i32).to_be_bytes());
        bytes[8..12].copy_from_slice(&(v.second() as i32).to_be_bytes());
        bytes[12..16].copy_from_slice(&(v.nanosecond() as i32).to_be_bytes());
        self.update(&bytes);
    }

    /// Epoch milliseconds, then the nanosecond fraction.
    pub fn put_timestamp(&mut self, v: NaiveDateTime) {
        let mut bytes = [0u8; 12];
        bytes[0..8].copy_from_slice(&v.and_utc().timestamp_millis().to_be_bytes());
        bytes[8..12].copy_from_slice(&(v.nanosecond() as i32).to_be_bytes());
        self.update(&bytes);
    }

    pub fn put_uuid(&mut self, v: &Uuid) {
        self.update(v.as_bytes());
    }

    /// Finish the digest as URL-safe base64 without padding.
    pub fn build(self) -> String {
        URL_SAFE_NO_PAD.encode(self.hasher.finalize())
    }
}
