// Helper functions for reading class-file data types from buffers
//
// Class files are big-endian throughout. Every read checks the remaining
// length so a truncated unit surfaces as an error instead of a panic.

use crate::error::{InstrumentError, InstrumentResult};
use bytes::Buf;

fn need(buf: &[u8], n: usize, what: &str) -> InstrumentResult<()> {
    if buf.remaining() < n {
        return Err(InstrumentError::Truncated(format!(
            "Not enough data for {}: expected {}, got {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Read a u8
pub fn read_u8(buf: &mut &[u8]) -> InstrumentResult<u8> {
    need(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

/// Read a u16
pub fn read_u16(buf: &mut &[u8]) -> InstrumentResult<u16> {
    need(buf, 2, "u16")?;
    Ok(buf.get_u16())
}

/// Read a i16
pub fn read_i16(buf: &mut &[u8]) -> InstrumentResult<i16> {
    need(buf, 2, "i16")?;
    Ok(buf.get_i16())
}

/// Read a u32
pub fn read_u32(buf: &mut &[u8]) -> InstrumentResult<u32> {
    need(buf, 4, "u32")?;
    Ok(buf.get_u32())
}

/// Read a i32
pub fn read_i32(buf: &mut &[u8]) -> InstrumentResult<i32> {
    need(buf, 4, "i32")?;
    Ok(buf.get_i32())
}

/// Read a u64
pub fn read_u64(buf: &mut &[u8]) -> InstrumentResult<u64> {
    need(buf, 8, "u64")?;
    Ok(buf.get_u64())
}

/// Read `len` raw bytes
pub fn read_bytes(buf: &mut &[u8], len: usize) -> InstrumentResult<Vec<u8>> {
    need(buf, len, "byte run")?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

/// Read a u32-length-prefixed blob (the attribute body layout)
pub fn read_blob(buf: &mut &[u8]) -> InstrumentResult<Vec<u8>> {
    let len = read_u32(buf)? as usize;
    read_bytes(buf, len)
}
