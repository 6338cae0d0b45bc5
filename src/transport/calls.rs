//! Typed call encoding for the simulator channel.
//!
//! The call set mirrors the driver surface: image load, buffer
//! bookkeeping, bulk copies, control-register access, per-instance
//! streaming-argument setup, queue traffic and completion polling. The
//! peer treats payloads as opaque; only this codec interprets them.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("payload truncated")]
    Truncated,
    #[error("string field is not valid UTF-8")]
    BadString,
}

/// One streaming-argument binding for a compute-unit instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamArg {
    pub arg_index: u64,
    pub flow_id: u64,
    pub tag: String,
}

/// Requests sent to the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Final image-load step: where to pick up the staged image files.
    LoadBitstream {
        xml_path: String,
        bitstream_path: String,
        device_dir: String,
        binary_dir: String,
        verbose: bool,
    },
    /// Image content shipped inline (alternate load path).
    LoadContent {
        xml: Vec<u8>,
        bitstream: Vec<u8>,
        emu_data: Vec<u8>,
        keep_dir: bool,
    },
    /// Mirror a device-buffer allocation into the peer's bookkeeping.
    AllocBuffer {
        addr: u64,
        size: u64,
        p2p: bool,
        export_path: String,
    },
    FreeBuffer {
        addr: u64,
    },
    /// One chunk of a host-to-device copy.
    WriteDevice {
        addr: u64,
        data: Vec<u8>,
    },
    /// One chunk of a device-to-host copy.
    ReadDevice {
        addr: u64,
        len: u64,
    },
    WriteControl {
        offset: u64,
        data: Vec<u8>,
    },
    ReadControl {
        offset: u64,
        len: u64,
    },
    /// Flush the buffered argument bindings of one instance.
    SetupInstance {
        instance_base: u64,
        args: Vec<StreamArg>,
    },
    CreateQueue {
        write: bool,
    },
    DestroyQueue {
        handle: u64,
    },
    WriteQueue {
        handle: u64,
        data: Vec<u8>,
    },
    ReadQueue {
        handle: u64,
        len: u64,
    },
    /// Ask how many bytes of one outstanding request have moved.
    PollCompletion {
        request_id: u64,
        spans: Vec<(u64, u64)>,
    },
    /// Attach a peer-exported backing file to a device region.
    ImportBuffer {
        path: String,
        addr: u64,
        size: u64,
    },
    Close,
}

/// Responses from the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Acknowledgment; `false` fails the operation.
    Ack(bool),
    /// Bulk data answering a read.
    Data(Vec<u8>),
    /// Scalar answering handle creation or byte-count queries.
    Value(u64),
}

mod op {
    pub const LOAD_BITSTREAM: u8 = 0x01;
    pub const LOAD_CONTENT: u8 = 0x02;
    pub const ALLOC_BUFFER: u8 = 0x03;
    pub const FREE_BUFFER: u8 = 0x04;
    pub const WRITE_DEVICE: u8 = 0x05;
    pub const READ_DEVICE: u8 = 0x06;
    pub const WRITE_CONTROL: u8 = 0x07;
    pub const READ_CONTROL: u8 = 0x08;
    pub const SETUP_INSTANCE: u8 = 0x09;
    pub const CREATE_QUEUE: u8 = 0x0A;
    pub const DESTROY_QUEUE: u8 = 0x0B;
    pub const WRITE_QUEUE: u8 = 0x0C;
    pub const READ_QUEUE: u8 = 0x0D;
    pub const POLL_COMPLETION: u8 = 0x0E;
    pub const IMPORT_BUFFER: u8 = 0x0F;
    pub const CLOSE: u8 = 0x10;

    pub const ACK: u8 = 0x80;
    pub const DATA: u8 = 0x81;
    pub const VALUE: u8 = 0x82;
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
    buf.extend_from_slice(data);
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn get_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, DecodeError> {
    let len = cursor.read_u64::<LittleEndian>().map_err(|_| DecodeError::Truncated)? as usize;
    let at = cursor.position() as usize;
    let data = cursor.get_ref();
    if at + len > data.len() {
        return Err(DecodeError::Truncated);
    }
    let out = data[at..at + len].to_vec();
    cursor.set_position((at + len) as u64);
    Ok(out)
}

fn get_str(cursor: &mut Cursor<&[u8]>) -> Result<String, DecodeError> {
    String::from_utf8(get_bytes(cursor)?).map_err(|_| DecodeError::BadString)
}

fn get_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64, DecodeError> {
    cursor.read_u64::<LittleEndian>().map_err(|_| DecodeError::Truncated)
}

fn get_bool(cursor: &mut Cursor<&[u8]>) -> Result<bool, DecodeError> {
    Ok(cursor.read_u8().map_err(|_| DecodeError::Truncated)? != 0)
}

impl Request {
    /// Encode into an opcode and payload for framing.
    pub fn encode(&self) -> (u8, Vec<u8>) {
        let mut buf = Vec::new();
        match self {
            Self::LoadBitstream { xml_path, bitstream_path, device_dir, binary_dir, verbose } => {
                put_str(&mut buf, xml_path);
                put_str(&mut buf, bitstream_path);
                put_str(&mut buf, device_dir);
                put_str(&mut buf, binary_dir);
                buf.push(u8::from(*verbose));
                (op::LOAD_BITSTREAM, buf)
            }
            Self::LoadContent { xml, bitstream, emu_data, keep_dir } => {
                put_bytes(&mut buf, xml);
                put_bytes(&mut buf, bitstream);
                put_bytes(&mut buf, emu_data);
                buf.push(u8::from(*keep_dir));
                (op::LOAD_CONTENT, buf)
            }
            Self::AllocBuffer { addr, size, p2p, export_path } => {
                buf.extend_from_slice(&(*addr).to_le_bytes());
                buf.extend_from_slice(&(*size).to_le_bytes());
                buf.push(u8::from(*p2p));
                put_str(&mut buf, export_path);
                (op::ALLOC_BUFFER, buf)
            }
            Self::FreeBuffer { addr } => {
                buf.extend_from_slice(&(*addr).to_le_bytes());
                (op::FREE_BUFFER, buf)
            }
            Self::WriteDevice { addr, data } => {
                buf.extend_from_slice(&(*addr).to_le_bytes());
                put_bytes(&mut buf, data);
                (op::WRITE_DEVICE, buf)
            }
            Self::ReadDevice { addr, len } => {
                buf.extend_from_slice(&(*addr).to_le_bytes());
                buf.extend_from_slice(&(*len).to_le_bytes());
                (op::READ_DEVICE, buf)
            }
            Self::WriteControl { offset, data } => {
                buf.extend_from_slice(&(*offset).to_le_bytes());
                put_bytes(&mut buf, data);
                (op::WRITE_CONTROL, buf)
            }
            Self::ReadControl { offset, len } => {
                buf.extend_from_slice(&(*offset).to_le_bytes());
                buf.extend_from_slice(&(*len).to_le_bytes());
                (op::READ_CONTROL, buf)
            }
            Self::SetupInstance { instance_base, args } => {
                buf.extend_from_slice(&(*instance_base).to_le_bytes());
                buf.extend_from_slice(&(args.len() as u64).to_le_bytes());
                for arg in args {
                    buf.extend_from_slice(&(arg.arg_index).to_le_bytes());
                    buf.extend_from_slice(&(arg.flow_id).to_le_bytes());
                    put_str(&mut buf, &arg.tag);
                }
                (op::SETUP_INSTANCE, buf)
            }
            Self::CreateQueue { write } => {
                buf.push(u8::from(*write));
                (op::CREATE_QUEUE, buf)
            }
            Self::DestroyQueue { handle } => {
                buf.extend_from_slice(&(*handle).to_le_bytes());
                (op::DESTROY_QUEUE, buf)
            }
            Self::WriteQueue { handle, data } => {
                buf.extend_from_slice(&(*handle).to_le_bytes());
                put_bytes(&mut buf, data);
                (op::WRITE_QUEUE, buf)
            }
            Self::ReadQueue { handle, len } => {
                buf.extend_from_slice(&(*handle).to_le_bytes());
                buf.extend_from_slice(&(*len).to_le_bytes());
                (op::READ_QUEUE, buf)
            }
            Self::PollCompletion { request_id, spans } => {
                buf.extend_from_slice(&(*request_id).to_le_bytes());
                buf.extend_from_slice(&(spans.len() as u64).to_le_bytes());
                for (va, len) in spans {
                    buf.extend_from_slice(&(*va).to_le_bytes());
                    buf.extend_from_slice(&(*len).to_le_bytes());
                }
                (op::POLL_COMPLETION, buf)
            }
            Self::ImportBuffer { path, addr, size } => {
                put_str(&mut buf, path);
                buf.extend_from_slice(&(*addr).to_le_bytes());
                buf.extend_from_slice(&(*size).to_le_bytes());
                (op::IMPORT_BUFFER, buf)
            }
            Self::Close => (op::CLOSE, buf),
        }
    }

    /// Decode a framed request. Used by the peer side of the channel.
    pub fn decode(opcode: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut cur = Cursor::new(payload);
        match opcode {
            op::LOAD_BITSTREAM => Ok(Self::LoadBitstream {
                xml_path: get_str(&mut cur)?,
                bitstream_path: get_str(&mut cur)?,
                device_dir: get_str(&mut cur)?,
                binary_dir: get_str(&mut cur)?,
                verbose: get_bool(&mut cur)?,
            }),
            op::LOAD_CONTENT => Ok(Self::LoadContent {
                xml: get_bytes(&mut cur)?,
                bitstream: get_bytes(&mut cur)?,
                emu_data: get_bytes(&mut cur)?,
                keep_dir: get_bool(&mut cur)?,
            }),
            op::ALLOC_BUFFER => Ok(Self::AllocBuffer {
                addr: get_u64(&mut cur)?,
                size: get_u64(&mut cur)?,
                p2p: get_bool(&mut cur)?,
                export_path: get_str(&mut cur)?,
            }),
            op::FREE_BUFFER => Ok(Self::FreeBuffer { addr: get_u64(&mut cur)? }),
            op::WRITE_DEVICE => Ok(Self::WriteDevice {
                addr: get_u64(&mut cur)?,
                data: get_bytes(&mut cur)?,
            }),
            op::READ_DEVICE => Ok(Self::ReadDevice {
                addr: get_u64(&mut cur)?,
                len: get_u64(&mut cur)?,
            }),
            op::WRITE_CONTROL => Ok(Self::WriteControl {
                offset: get_u64(&mut cur)?,
                data: get_bytes(&mut cur)?,
            }),
            op::READ_CONTROL => Ok(Self::ReadControl {
                offset: get_u64(&mut cur)?,
                len: get_u64(&mut cur)?,
            }),
            op::SETUP_INSTANCE => {
                let instance_base = get_u64(&mut cur)?;
                let count = get_u64(&mut cur)? as usize;
                let mut args = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    args.push(StreamArg {
                        arg_index: get_u64(&mut cur)?,
                        flow_id: get_u64(&mut cur)?,
                        tag: get_str(&mut cur)?,
                    });
                }
                Ok(Self::SetupInstance { instance_base, args })
            }
            op::CREATE_QUEUE => Ok(Self::CreateQueue { write: get_bool(&mut cur)? }),
            op::DESTROY_QUEUE => Ok(Self::DestroyQueue { handle: get_u64(&mut cur)? }),
            op::WRITE_QUEUE => Ok(Self::WriteQueue {
                handle: get_u64(&mut cur)?,
                data: get_bytes(&mut cur)?,
            }),
            op::READ_QUEUE => Ok(Self::ReadQueue {
                handle: get_u64(&mut cur)?,
                len: get_u64(&mut cur)?,
            }),
            op::POLL_COMPLETION => {
                let request_id = get_u64(&mut cur)?;
                let count = get_u64(&mut cur)? as usize;
                let mut spans = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    spans.push((get_u64(&mut cur)?, get_u64(&mut cur)?));
                }
                Ok(Self::PollCompletion { request_id, spans })
            }
            op::IMPORT_BUFFER => Ok(Self::ImportBuffer {
                path: get_str(&mut cur)?,
                addr: get_u64(&mut cur)?,
                size: get_u64(&mut cur)?,
            }),
            op::CLOSE => Ok(Self::Close),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }
}

impl Response {
    pub fn encode(&self) -> (u8, Vec<u8>) {
        let mut buf = Vec::new();
        match self {
            Self::Ack(ok) => {
                buf.push(u8::from(*ok));
                (op::ACK, buf)
            }
            Self::Data(data) => {
                put_bytes(&mut buf, data);
                (op::DATA, buf)
            }
            Self::Value(value) => {
                buf.extend_from_slice(&(*value).to_le_bytes());
                (op::VALUE, buf)
            }
        }
    }

    pub fn decode(opcode: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut cur = Cursor::new(payload);
        match opcode {
            op::ACK => Ok(Self::Ack(get_bool(&mut cur)?)),
            op::DATA => Ok(Self::Data(get_bytes(&mut cur)?)),
            op::VALUE => Ok(Self::Value(get_u64(&mut cur)?)),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }
}
