use bytes::{Buf, BufMut};
use thiserror::Error;

/// Size of one wire-encoded reading: eleven 4-byte little-endian fields.
pub const WIRE_SIZE: usize = 44;

/// One decoded telemetry record, fields in wire order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub wifi: i32,
    pub co2: i32,
    pub pm01: i32,
    pub pm25: i32,
    pub pm10: i32,
    pub pm03_count: i32,
    pub tvoc: i32,
    pub nox: i32,
    pub temperature: f32,
    pub humidity: i32,
    pub boot: i32,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload truncated: need {WIRE_SIZE} bytes, got {len}")]
    Truncated { len: usize },
}

/// Decodes the fixed 44-byte little-endian layout. Trailing bytes are
/// ignored so producers can append fields without breaking older sinks.
/// No range validation is applied to any field.
pub fn decode(payload: &[u8]) -> Result<SensorReading, DecodeError> {
    if payload.len() < WIRE_SIZE {
        return Err(DecodeError::Truncated { len: payload.len() });
    }
    let mut buf = payload;
    Ok(SensorReading {
        wifi: buf.get_i32_le(),
        co2: buf.get_i32_le(),
        pm01: buf.get_i32_le(),
        pm25: buf.get_i32_le(),
        pm10: buf.get_i32_le(),
        pm03_count: buf.get_i32_le(),
        tvoc: buf.get_i32_le(),
        nox: buf.get_i32_le(),
        temperature: buf.get_f32_le(),
        humidity: buf.get_i32_le(),
        boot: buf.get_i32_le(),
    })
}

impl SensorReading {
    /// Inverse of [`decode`]; produces exactly the wire layout.
    pub fn encode(&self) -> [u8; WIRE_SIZE] {
        let mut out = [0u8; WIRE_SIZE];
        let mut buf = &mut out[..];
        buf.put_i32_le(self.wifi);
        buf.put_i32_le(self.co2);
        buf.put_i32_le(self.pm01);
        buf.put_i32_le(self.pm25);
        buf.put_i32_le(self.pm10);
        buf.put_i32_le(self.pm03_count);
        buf.put_i32_le(self.tvoc);
        buf.put_i32_le(self.nox);
        buf.put_f32_le(self.temperature);
        buf.put_i32_le(self.humidity);
        buf.put_i32_le(self.boot);
        out
    }
}
