// StackMapTable decoding and encoding
//
// Frames are decoded to absolute bytecode offsets so they can be moved when
// code is inserted, then re-encoded with the most compact form that still
// fits the new offset deltas.

use crate::error::{InstrumentError, InstrumentResult};
use crate::reader::{read_u16, read_u8};
use bytes::BufMut;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Class constant index
    Object(u16),
    /// Offset of the `new` instruction that created the value
    Uninitialized(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Same,
    SameLocals1StackItem(VerificationType),
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMapFrame {
    pub offset: u32,
    pub body: FrameBody,
}

fn read_vtype(buf: &mut &[u8]) -> InstrumentResult<VerificationType> {
    let tag = read_u8(buf)?;
    Ok(match tag {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(read_u16(buf)?),
        8 => VerificationType::Uninitialized(read_u16(buf)? as u32),
        _ => {
            return Err(InstrumentError::Malformed(format!(
                "unknown verification type tag {}",
                tag
            )))
        }
    })
}

fn read_vtypes(buf: &mut &[u8], count: usize) -> InstrumentResult<Vec<VerificationType>> {
    (0..count).map(|_| read_vtype(buf)).collect()
}

fn write_vtype(vtype: &VerificationType, out: &mut Vec<u8>) -> InstrumentResult<()> {
    match vtype {
        VerificationType::Top => out.put_u8(0),
        VerificationType::Integer => out.put_u8(1),
        VerificationType::Float => out.put_u8(2),
        VerificationType::Double => out.put_u8(3),
        VerificationType::Long => out.put_u8(4),
        VerificationType::Null => out.put_u8(5),
        VerificationType::UninitializedThis => out.put_u8(6),
        VerificationType::Object(class) => {
            out.put_u8(7);
            out.put_u16(*class);
        }
        VerificationType::Uninitialized(offset) => {
            out.put_u8(8);
            out.put_u16(u16_offset(*offset)?);
        }
    }
    Ok(())
}

fn u16_offset(offset: u32) -> InstrumentResult<u16> {
    u16::try_from(offset).map_err(|_| InstrumentError::CodeTooLarge(offset as usize))
}

/// Decode the body of a StackMapTable attribute
pub fn decode(info: &[u8]) -> InstrumentResult<Vec<StackMapFrame>> {
    let mut buf = info;
    let count = read_u16(&mut buf)?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut previous: Option<u32> = None;

    for _ in 0..count {
        let frame_type = read_u8(&mut buf)?;
        let (delta, body) = match frame_type {
            0..=63 => (frame_type as u32, FrameBody::Same),
            64..=127 => (
                (frame_type - 64) as u32,
                FrameBody::SameLocals1StackItem(read_vtype(&mut buf)?),
            ),
            247 => {
                let delta = read_u16(&mut buf)? as u32;
                (delta, FrameBody::SameLocals1StackItem(read_vtype(&mut buf)?))
            }
            248..=250 => (read_u16(&mut buf)? as u32, FrameBody::Chop(251 - frame_type)),
            251 => (read_u16(&mut buf)? as u32, FrameBody::Same),
            252..=254 => {
                let delta = read_u16(&mut buf)? as u32;
                let locals = read_vtypes(&mut buf, (frame_type - 251) as usize)?;
                (delta, FrameBody::Append(locals))
            }
            255 => {
                let delta = read_u16(&mut buf)? as u32;
                let local_count = read_u16(&mut buf)? as usize;
                let locals = read_vtypes(&mut buf, local_count)?;
                let stack_count = read_u16(&mut buf)? as usize;
                let stack = read_vtypes(&mut buf, stack_count)?;
                (delta, FrameBody::Full { locals, stack })
            }
            _ => {
                return Err(InstrumentError::Malformed(format!(
                    "reserved stack map frame type {}",
                    frame_type
                )))
            }
        };

        let offset = match previous {
            None => delta,
            Some(prev) => prev + delta + 1,
        };
        previous = Some(offset);
        frames.push(StackMapFrame { offset, body });
    }

    if !buf.is_empty() {
        return Err(InstrumentError::Malformed(
            "trailing bytes in StackMapTable".to_string(),
        ));
    }

    Ok(frames)
}

/// Encode frames (sorted by strictly increasing offset) as a StackMapTable body
pub fn encode(frames: &[StackMapFrame]) -> InstrumentResult<Vec<u8>> {
    let mut out = Vec::new();
    out.put_u16(
        u16::try_from(frames.len())
            .map_err(|_| InstrumentError::Malformed("too many stack map frames".to_string()))?,
    );

    let mut previous: Option<u32> = None;
    for frame in frames {
        let delta = match previous {
            None => frame.offset,
            Some(prev) if frame.offset > prev => frame.offset - prev - 1,
            Some(_) => {
                return Err(InstrumentError::Malformed(format!(
                    "stack map frames out of order at offset {}",
                    frame.offset
                )))
            }
        };
        previous = Some(frame.offset);
        let wide_delta = u16_offset(delta)?;

        match &frame.body {
            FrameBody::Same if delta <= 63 => out.put_u8(delta as u8),
            FrameBody::Same => {
                out.put_u8(251);
                out.put_u16(wide_delta);
            }
            FrameBody::SameLocals1StackItem(item) => {
                if delta <= 63 {
                    out.put_u8(64 + delta as u8);
                } else {
                    out.put_u8(247);
                    out.put_u16(wide_delta);
                }
                write_vtype(item, &mut out)?;
            }
            FrameBody::Chop(k) => {
                out.put_u8(251 - k);
                out.put_u16(wide_delta);
            }
            FrameBody::Append(locals) => {
                out.put_u8(251 + locals.len() as u8);
                out.put_u16(wide_delta);
                for local in locals {
                    write_vtype(local, &mut out)?;
                }
            }
            FrameBody::Full { locals, stack } => {
                out.put_u8(255);
                out.put_u16(wide_delta);
                out.put_u16(locals.len() as u16);
                for local in locals {
                    write_vtype(local, &mut out)?;
                }
                out.put_u16(stack.len() as u16);
                for item in stack {
                    write_vtype(item, &mut out)?;
                }
            }
        }
    }

    Ok(out)
}

/// Move every frame and every `Uninitialized` reference through the given
/// offset maps. `frame_at` maps frame positions (branch-target semantics),
/// `insn_at` maps the position of a `new` instruction itself.
pub fn relocate(
    frames: &mut [StackMapFrame],
    frame_at: impl Fn(u32) -> InstrumentResult<u32>,
    insn_at: impl Fn(u32) -> InstrumentResult<u32>,
) -> InstrumentResult<()> {
    let relocate_vtype = |vtype: &mut VerificationType| -> InstrumentResult<()> {
        if let VerificationType::Uninitialized(offset) = vtype {
            *offset = insn_at(*offset)?;
        }
        Ok(())
    };

    for frame in frames.iter_mut() {
        frame.offset = frame_at(frame.offset)?;
        match &mut frame.body {
            FrameBody::Same | FrameBody::Chop(_) => {}
            FrameBody::SameLocals1StackItem(item) => relocate_vtype(item)?,
            FrameBody::Append(locals) => {
                for local in locals.iter_mut() {
                    relocate_vtype(local)?;
                }
            }
            FrameBody::Full { locals, stack } => {
                for vtype in locals.iter_mut().chain(stack.iter_mut()) {
                    relocate_vtype(vtype)?;
                }
            }
        }
    }
    Ok(())
}
