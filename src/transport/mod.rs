//! Chunked request/response transport to the simulator process.
//!
//! Control calls (image load, buffer bookkeeping, queue and instance
//! setup) are single request/response exchanges. Bulk copies are split
//! into sequential chunks no larger than the configured message size
//! (default 8 MiB); `seek`/`skip` offsets are applied to the base
//! addresses once, before chunking begins, and the aggregate count
//! returned to the caller is the sum of per-chunk requests. Callers
//! depend on that for read/write-after-seek semantics.
//!
//! Already-sent chunks are not rolled back when a later chunk fails;
//! only the error is surfaced.

pub mod calls;
pub mod channel;
pub mod frame;

pub use calls::{DecodeError, Request, Response, StreamArg};
pub use channel::{Channel, ChannelError};

use crate::xclbin::instance_base;

/// Transport client bound to one device session's channel.
#[derive(Debug)]
pub struct Transport {
    channel: Channel,
    message_size: u64,
}

impl Transport {
    pub fn new(channel: Channel, message_size: u64) -> Self {
        Self { channel, message_size: message_size.max(1) }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn message_size(&self) -> u64 {
        self.message_size
    }

    fn expect_ack(&self, request: &Request, what: &'static str) -> Result<(), ChannelError> {
        match self.channel.call(request)? {
            Response::Ack(true) => Ok(()),
            Response::Ack(false) => Err(ChannelError::Nack(what)),
            _ => Err(ChannelError::UnexpectedResponse(what)),
        }
    }

    fn expect_value(&self, request: &Request, what: &'static str) -> Result<u64, ChannelError> {
        match self.channel.call(request)? {
            Response::Value(value) => Ok(value),
            _ => Err(ChannelError::UnexpectedResponse(what)),
        }
    }

    fn expect_data(&self, request: &Request, what: &'static str) -> Result<Vec<u8>, ChannelError> {
        match self.channel.call(request)? {
            Response::Data(data) => Ok(data),
            _ => Err(ChannelError::UnexpectedResponse(what)),
        }
    }

    /// Final image-load step pointing the simulator at the staged files.
    pub fn load_bitstream(
        &self,
        xml_path: &str,
        bitstream_path: &str,
        device_dir: &str,
        binary_dir: &str,
        verbose: bool,
    ) -> Result<(), ChannelError> {
        self.expect_ack(
            &Request::LoadBitstream {
                xml_path: xml_path.into(),
                bitstream_path: bitstream_path.into(),
                device_dir: device_dir.into(),
                binary_dir: binary_dir.into(),
                verbose,
            },
            "load_bitstream",
        )
    }

    /// Ship image content inline (alternate load path).
    pub fn load_content(
        &self,
        xml: &[u8],
        bitstream: &[u8],
        emu_data: &[u8],
        keep_dir: bool,
    ) -> Result<(), ChannelError> {
        self.expect_ack(
            &Request::LoadContent {
                xml: xml.to_vec(),
                bitstream: bitstream.to_vec(),
                emu_data: emu_data.to_vec(),
                keep_dir,
            },
            "load_content",
        )
    }

    /// Mirror an allocation into the simulator's bookkeeping.
    pub fn alloc_buffer(
        &self,
        addr: u64,
        size: u64,
        p2p: bool,
        export_path: &str,
    ) -> Result<(), ChannelError> {
        self.expect_ack(
            &Request::AllocBuffer { addr, size, p2p, export_path: export_path.into() },
            "alloc_buffer",
        )
    }

    pub fn free_buffer(&self, addr: u64) -> Result<(), ChannelError> {
        self.expect_ack(&Request::FreeBuffer { addr }, "free_buffer")
    }

    pub fn import_buffer(&self, path: &str, addr: u64, size: u64) -> Result<(), ChannelError> {
        self.expect_ack(&Request::ImportBuffer { path: path.into(), addr, size }, "import_buffer")
    }

    /// Copy `size` bytes of `src[seek..]` to device address `dest + seek`.
    ///
    /// Returns the aggregate byte count, which equals `size` when every
    /// chunk call succeeds.
    pub fn copy_host_to_device(
        &self,
        dest: u64,
        src: &[u8],
        size: usize,
        seek: usize,
    ) -> Result<u64, ChannelError> {
        let window = src.get(seek..seek + size).ok_or_else(|| {
            ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek/size exceeds host buffer",
            ))
        })?;
        let dest = dest + seek as u64;

        let mut processed = 0u64;
        for chunk in window.chunks(self.message_size as usize) {
            self.expect_ack(
                &Request::WriteDevice { addr: dest + processed, data: chunk.to_vec() },
                "copy_host_to_device",
            )?;
            processed += chunk.len() as u64;
        }
        Ok(processed)
    }

    /// Copy `size` bytes from device address `src + skip` into
    /// `dest[skip..]`.
    pub fn copy_device_to_host(
        &self,
        dest: &mut [u8],
        src: u64,
        size: usize,
        skip: usize,
    ) -> Result<u64, ChannelError> {
        let window = dest.get_mut(skip..skip + size).ok_or_else(|| {
            ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "skip/size exceeds host buffer",
            ))
        })?;
        let src = src + skip as u64;
        let message_size = self.message_size as usize;

        let mut processed = 0usize;
        while processed < size {
            let chunk_len = message_size.min(size - processed);
            let data = self.expect_data(
                &Request::ReadDevice { addr: src + processed as u64, len: chunk_len as u64 },
                "copy_device_to_host",
            )?;
            if data.len() != chunk_len {
                return Err(ChannelError::UnexpectedResponse("copy_device_to_host"));
            }
            window[processed..processed + chunk_len].copy_from_slice(&data);
            processed += chunk_len;
        }
        Ok(processed as u64)
    }

    /// Control-register window write.
    pub fn write_control(&self, offset: u64, data: &[u8]) -> Result<(), ChannelError> {
        self.expect_ack(&Request::WriteControl { offset, data: data.to_vec() }, "write_control")
    }

    /// Control-register window read.
    pub fn read_control(&self, offset: u64, len: u64) -> Result<Vec<u8>, ChannelError> {
        self.expect_data(&Request::ReadControl { offset, len }, "read_control")
    }

    pub fn setup_instance(&self, base: u64, args: Vec<StreamArg>) -> Result<(), ChannelError> {
        self.expect_ack(&Request::SetupInstance { instance_base: base, args }, "setup_instance")
    }

    /// Create a queue; the simulator hands back a non-zero handle.
    pub fn create_queue(&self, write: bool) -> Result<u64, ChannelError> {
        self.expect_value(&Request::CreateQueue { write }, "create_queue")
    }

    pub fn destroy_queue(&self, handle: u64) -> Result<(), ChannelError> {
        self.expect_ack(&Request::DestroyQueue { handle }, "destroy_queue")
    }

    pub fn write_queue(&self, handle: u64, data: &[u8]) -> Result<u64, ChannelError> {
        self.expect_value(&Request::WriteQueue { handle, data: data.to_vec() }, "write_queue")
    }

    /// Read up to `buf.len()` bytes; 0 means nothing was available.
    pub fn read_queue(&self, handle: u64, buf: &mut [u8]) -> Result<u64, ChannelError> {
        let data = self.expect_data(
            &Request::ReadQueue { handle, len: buf.len() as u64 },
            "read_queue",
        )?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n as u64)
    }

    /// Bytes the simulator reports transferred for one outstanding
    /// request; 0 leaves the request outstanding.
    pub fn poll_completion(
        &self,
        request_id: u64,
        spans: &[(u64, u64)],
    ) -> Result<u64, ChannelError> {
        self.expect_value(
            &Request::PollCompletion { request_id, spans: spans.to_vec() },
            "poll_completion",
        )
    }

    pub fn close_session(&self) -> Result<(), ChannelError> {
        self.expect_ack(&Request::Close, "close")
    }
}

/// Groups streaming-argument bindings per compute-unit instance.
///
/// Connectivity rows arrive in table order. Bindings for one instance
/// (identified by the masked flow id of the row's memory entry) are
/// buffered and flushed as a single setup call when the next row
/// targets a different instance, or when the table ends. This turns
/// N argument bindings into one call per instance.
pub struct InstanceBinder {
    pending: Vec<StreamArg>,
    current_base: Option<u64>,
}

impl InstanceBinder {
    pub fn new() -> Self {
        Self { pending: Vec::new(), current_base: None }
    }

    /// Account one connectivity row. Only streaming rows contribute a
    /// binding, but every row participates in instance-change detection.
    pub fn visit_row(
        &mut self,
        transport: &Transport,
        flow_id: u64,
        binding: Option<StreamArg>,
    ) -> Result<(), ChannelError> {
        let base = instance_base(flow_id);
        if let Some(current) = self.current_base {
            if current != base {
                self.flush(transport, current)?;
            }
        }
        self.current_base = Some(base);
        if let Some(arg) = binding {
            self.pending.push(arg);
        }
        Ok(())
    }

    /// Flush the final instance at the end of the table.
    pub fn finish(mut self, transport: &Transport) -> Result<(), ChannelError> {
        if let Some(base) = self.current_base.take() {
            self.flush(transport, base)?;
        }
        Ok(())
    }

    fn flush(&mut self, transport: &Transport, base: u64) -> Result<(), ChannelError> {
        let args = std::mem::take(&mut self.pending);
        log::debug!("setup instance {:#x}: {} streaming args", base, args.len());
        transport.setup_instance(base, args)
    }
}

impl Default for InstanceBinder {
    fn default() -> Self {
        Self::new()
    }
}
