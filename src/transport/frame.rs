//! Length-prefixed framing for the simulator channel.
//!
//! Every message is one frame: a 32-bit little-endian length covering
//! the opcode byte and payload, then the opcode, then the payload. One
//! request frame is always answered by exactly one response frame.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Upper bound on a single frame. Bulk data is chunked well below this;
/// anything larger means a corrupted stream.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Write one frame and flush it.
pub fn write_frame<W: Write>(writer: &mut W, opcode: u8, payload: &[u8]) -> io::Result<()> {
    let len = 1 + payload.len();
    if len > MAX_FRAME_LEN as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
    }
    writer.write_u32::<LittleEndian>(len as u32)?;
    writer.write_u8(opcode)?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one frame, returning its opcode and payload.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<(u8, Vec<u8>)> {
    let len = reader.read_u32::<LittleEndian>()?;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad frame length {len:#x}"),
        ));
    }
    let opcode = reader.read_u8()?;
    let mut payload = vec![0u8; len as usize - 1];
    reader.read_exact(&mut payload)?;
    Ok((opcode, payload))
}
