//! Device session: the accelerator-driver surface presented to client
//! software.
//!
//! A [`Device`] owns one emulated accelerator: its DDR bank allocators,
//! its buffer-object registry, its streaming-queue tracker and the
//! channel to the supervised simulator process. Compute happens in the
//! simulator; this side mirrors bookkeeping and moves bytes.
//!
//! # Concurrency
//!
//! One mutex serializes every public entry point of a session, so API
//! calls on one device are strictly ordered while independent devices
//! proceed concurrently. Process launch is additionally guarded by the
//! supervisor's own lock: a racing caller observes the already-created
//! channel and returns without double-launching.
//!
//! # Failure surface
//!
//! Invalid input and transport failures surface as errors from the
//! operation that hit them; chunked copies already sent stay sent.
//! Freeing an unknown handle is a no-op. Abnormal termination of the
//! simulator tears down the whole process tree via [`crate::process::crash`].

pub mod buffer;
pub mod queue;

pub use buffer::{
    bank_index, is_p2p, BufferError, BufferObject, BufferProperties, BufferRegistry, Mapping,
    FLAG_BANK_MASK, FLAG_HOST_ONLY, FLAG_P2P, NULL_HANDLE,
};
pub use queue::{Completion, OutstandingRequest, QueueTracker};

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::Config;
use crate::hooks::ApiHooks;
use crate::launcher::CommandWindow;
use crate::mem::{DdrBank, MemoryManager, NULL_ADDR};
use crate::process::{crash, SessionRecord, Supervisor};
use crate::transport::{InstanceBinder, StreamArg, Transport};
use crate::xclbin::{
    Connectivity, MemTopology, MemType, PlatformMetadata, SectionKind, Xclbin,
};

/// Minimum device-buffer alignment quantum (one page).
pub const BUFFER_ALIGNMENT: u64 = 4096;

/// Direction of a blocking buffer synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    ToDevice,
    FromDevice,
}

/// Static session information plus live free-memory accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub ddr_size: u64,
    pub bank_count: usize,
    pub ddr_free_size: u64,
}

struct DeviceState {
    memory: Vec<MemoryManager>,
    buffers: BufferRegistry,
    queues: QueueTracker,
    call_log: Option<fs::File>,
    command_window: Option<CommandWindow>,
    hooks: ApiHooks,
}

/// One open device session.
pub struct Device {
    index: u32,
    config: Config,
    record: Arc<SessionRecord>,
    supervisor: Supervisor,
    state: Mutex<DeviceState>,
}

/// Holds the per-device lock for the duration of one API call and
/// writes the call-log trailer on the way out.
struct ApiCall<'a> {
    guard: MutexGuard<'a, DeviceState>,
    name: &'static str,
}

impl Deref for ApiCall<'_> {
    type Target = DeviceState;
    fn deref(&self) -> &DeviceState {
        &self.guard
    }
}

impl DerefMut for ApiCall<'_> {
    fn deref_mut(&mut self) -> &mut DeviceState {
        &mut self.guard
    }
}

impl Drop for ApiCall<'_> {
    fn drop(&mut self) {
        if let Some(log) = &mut self.guard.call_log {
            let _ = writeln!(log, "{} ended", self.name);
        }
        self.guard.hooks.exit(self.name);
    }
}

impl Device {
    /// Open a session for device `index` with the DDR banks the
    /// platform reports.
    pub fn open(index: u32, banks: &[DdrBank]) -> Result<Self> {
        Self::open_with_config(index, banks, Config::get().clone())
    }

    /// Open with an explicit configuration instead of the process-wide
    /// one.
    pub fn open_with_config(index: u32, banks: &[DdrBank], config: Config) -> Result<Self> {
        // Initialize logging if the host has not already done so
        let _ = env_logger::try_init();

        let device_dir = config
            .run_dir()
            .join(std::process::id().to_string())
            .join("sw_emu")
            .join(format!("device{index}"));

        let record = SessionRecord::new(index, device_dir);
        let supervisor = Supervisor::new(index, record.clone(), config.clone());

        let call_log = match config.hal_log() {
            Some(path) => {
                let mut file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening call log {path}"))?;
                let _ = writeln!(file, "FUNCTION, THREAD ID, ARG...");
                Some(file)
            }
            None => None,
        };

        // Banks are stacked from address 0; an address names its bank by
        // range.
        let mut memory = Vec::with_capacity(banks.len());
        let mut base = 0u64;
        for bank in banks {
            memory.push(MemoryManager::new(bank.size, base, BUFFER_ALIGNMENT));
            base += bank.size;
        }

        crash::register(record.clone());
        log::info!("device {} opened with {} bank(s), {:#x} bytes", index, banks.len(), base);

        Ok(Self {
            index,
            config,
            record,
            supervisor,
            state: Mutex::new(DeviceState {
                memory,
                buffers: BufferRegistry::new(),
                queues: QueueTracker::new(),
                call_log,
                command_window: None,
                hooks: ApiHooks::default(),
            }),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Install host-environment instrumentation callbacks.
    pub fn set_hooks(&self, hooks: ApiHooks) {
        self.state.lock().expect("device lock poisoned").hooks = hooks;
    }

    fn begin(&self, name: &'static str, args: std::fmt::Arguments<'_>) -> ApiCall<'_> {
        let mut guard = self.state.lock().expect("device lock poisoned");
        guard.hooks.enter(name);
        if let Some(log) = &mut guard.call_log {
            let _ = writeln!(log, "{}, {:?}, {}", name, std::thread::current().id(), args);
        }
        ApiCall { guard, name }
    }

    /// The channel, launching the simulator lazily on first use.
    fn ensure_transport(&self) -> Result<Arc<Transport>> {
        if let Some(transport) = self.supervisor.transport() {
            return Ok(transport);
        }
        let (transport, _binary_dir) = self.supervisor.launch(false)?;
        Ok(transport)
    }

    fn transport_or_fail(&self) -> Result<Arc<Transport>> {
        self.supervisor
            .transport()
            .ok_or_else(|| anyhow!("device {} has no simulator channel", self.index))
    }

    // ------------------------------------------------------------------
    // Image load
    // ------------------------------------------------------------------

    /// Load a binary image onto the device.
    ///
    /// Launches the simulator on first load, stages the image sections
    /// into a fresh generation directory and drives the load calls.
    /// Legacy containers and out-of-range connectivity references fail
    /// the load before any setup call is issued.
    pub fn load_binary(&self, image: &[u8]) -> Result<()> {
        let mut call = self.begin("load_binary", format_args!("{} bytes", image.len()));
        let xclbin = Xclbin::parse(image)?;

        // An AIE-metadata section selects the alternate load path.
        if xclbin.find_section(SectionKind::AieMetadata).is_some() {
            self.load_binary_via_launcher(&mut *call, &xclbin)
        } else {
            self.load_binary_standard(&mut *call, &xclbin)
        }
    }

    fn load_binary_standard(&self, state: &mut DeviceState, xclbin: &Xclbin<'_>) -> Result<()> {
        let metadata = xclbin
            .find_section(SectionKind::EmbeddedMetadata)
            .ok_or_else(|| anyhow!("image carries no embedded metadata"))?;

        let debuggable = self.config.enable_kernel_debug()
            && xclbin.find_section(SectionKind::DebugData).is_some();

        let (transport, binary_dir) = self.supervisor.launch(debuggable)?;
        self.reset_program(state);

        let xml_path = buffer::unique_path(&binary_dir, "xmltmp");
        fs::write(&xml_path, metadata.data)
            .with_context(|| format!("staging metadata at {}", xml_path.display()))?;

        let bitstream = xclbin
            .find_section(SectionKind::Bitstream)
            .map(|s| s.data)
            .unwrap_or(&[]);
        let bitstream_path = buffer::unique_path(&binary_dir, "dltmp");
        fs::write(&bitstream_path, bitstream)
            .with_context(|| format!("staging bitstream at {}", bitstream_path.display()))?;

        self.bind_instances(&transport, xclbin)?;
        self.expand_emulation_data(&binary_dir, xclbin)?;

        transport.load_bitstream(
            &xml_path.display().to_string(),
            &bitstream_path.display().to_string(),
            &self.supervisor.device_dir().display().to_string(),
            &binary_dir.display().to_string(),
            state.call_log.is_some(),
        )?;
        log::info!("device {}: image loaded into {}", self.index, binary_dir.display());
        Ok(())
    }

    /// Alternate load path: the image is announced to the external
    /// launcher through the command window, and the content travels
    /// inline over the channel. No child is spawned; the launcher owns
    /// execution.
    fn load_binary_via_launcher(
        &self,
        state: &mut DeviceState,
        xclbin: &Xclbin<'_>,
    ) -> Result<()> {
        let metadata_section = xclbin
            .find_section(SectionKind::EmbeddedMetadata)
            .ok_or_else(|| anyhow!("image carries no embedded metadata"))?;

        if !self.config.dont_run() {
            let metadata = PlatformMetadata::parse(metadata_section.data)?;
            if state.command_window.is_none() {
                state.command_window = Some(CommandWindow::open_device_memory()?);
            }
            let image_name = format!("{}.xclbin", metadata.project_name);
            state
                .command_window
                .as_mut()
                .expect("window mapped above")
                .send_load_image(&image_name)?;
        }

        let (transport, binary_dir) = self.supervisor.launch_detached()?;
        self.reset_program(state);
        self.bind_instances(&transport, xclbin)?;

        let bitstream = xclbin
            .find_section(SectionKind::Bitstream)
            .map(|s| s.data)
            .unwrap_or(&[]);
        let emu_data = xclbin
            .find_section(SectionKind::EmulationData)
            .map(|s| s.data)
            .unwrap_or(&[]);

        transport.load_content(
            metadata_section.data,
            bitstream,
            emu_data,
            self.config.keep_run_dir(),
        )?;
        transport.load_bitstream(
            "",
            "",
            &self.supervisor.device_dir().display().to_string(),
            &binary_dir.display().to_string(),
            state.call_log.is_some(),
        )?;
        Ok(())
    }

    /// Join the connectivity table against the memory topology and
    /// flush streaming-argument bindings grouped per instance.
    ///
    /// Every referenced topology index is validated before the first
    /// setup call goes out, so an out-of-range reference aborts the
    /// load with nothing committed.
    fn bind_instances(&self, transport: &Transport, xclbin: &Xclbin<'_>) -> Result<()> {
        let (Some(topology_section), Some(connectivity_section)) = (
            xclbin.memory_topology_section(),
            xclbin.find_section(SectionKind::Connectivity),
        ) else {
            return Ok(());
        };

        let topology = MemTopology::parse(topology_section.data)?;
        let connectivity = Connectivity::parse(connectivity_section.data)?;

        for row in connectivity.rows() {
            topology.row(row.mem_data_index)?;
        }

        let mut binder = InstanceBinder::new();
        for row in connectivity.rows() {
            let mem = topology.row(row.mem_data_index)?;
            let binding = (mem.kind() == MemType::Streaming).then(|| StreamArg {
                arg_index: row.arg_index as u64,
                flow_id: mem.flow_id(),
                tag: mem.tag(),
            });
            binder.visit_row(transport, mem.flow_id(), binding)?;
        }
        binder.finish(transport)?;
        Ok(())
    }

    /// Expand the emulation auxiliary archive into the generation
    /// directory. Best effort: a missing archiver is logged, not fatal.
    fn expand_emulation_data(&self, binary_dir: &PathBuf, xclbin: &Xclbin<'_>) -> Result<()> {
        let Some(section) = xclbin.find_section(SectionKind::EmulationData) else {
            return Ok(());
        };
        if section.data.len() <= 1 {
            return Ok(());
        }

        let archive_path = buffer::unique_path(binary_dir, "emuDataFile");
        fs::write(&archive_path, section.data)
            .with_context(|| format!("staging emulation data at {}", archive_path.display()))?;

        let status = std::process::Command::new("unzip")
            .arg("-o")
            .arg("-q")
            .arg(&archive_path)
            .arg("-d")
            .arg(binary_dir)
            .status();
        match status {
            Ok(status) if status.success() => {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(binary_dir, fs::Permissions::from_mode(0o777));
            }
            Ok(status) => log::warn!("emulation-data expansion exited with {status}"),
            Err(e) => log::warn!("emulation-data expansion failed to run: {e}"),
        }
        Ok(())
    }

    /// Drop host-side state carried over from a previous image.
    fn reset_program(&self, state: &mut DeviceState) {
        state.buffers.release_host_state();
    }

    // ------------------------------------------------------------------
    // Raw device memory
    // ------------------------------------------------------------------

    /// Allocate raw device memory with no owning buffer object.
    ///
    /// Banks are tried in order and the first with space wins. The
    /// allocation is mirrored to the simulator like a buffer-object
    /// creation; a refused mirror call releases the region again.
    pub fn alloc_device_memory(&self, size: u64) -> Result<u64> {
        let mut call = self.begin("alloc_device_memory", format_args!("{size:#x}"));
        let transport = self.ensure_transport()?;

        let mut base = NULL_ADDR;
        let mut bank = 0usize;
        for (index, manager) in call.memory.iter_mut().enumerate() {
            base = manager.alloc(size);
            if base != NULL_ADDR {
                bank = index;
                break;
            }
        }
        if base == NULL_ADDR {
            bail!("out of memory: no bank can satisfy {:#x} bytes", size);
        }

        if let Err(e) = transport.alloc_buffer(base, size, false, "") {
            call.memory[bank].free(base);
            return Err(e).context("mirroring allocation to simulator");
        }
        Ok(base)
    }

    /// Release raw device memory by address.
    ///
    /// The owning bank is found by range; an address no bank covers is
    /// ignored.
    pub fn free_device_memory(&self, addr: u64) {
        let mut call = self.begin("free_device_memory", format_args!("{addr:#x}"));
        for manager in &mut call.memory {
            if manager.contains(addr) {
                manager.free(addr);
                break;
            }
        }
        if let Some(transport) = self.supervisor.transport() {
            if let Err(e) = transport.free_buffer(addr) {
                log::warn!("device {}: simulator free failed: {}", self.index, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Buffer objects
    // ------------------------------------------------------------------

    /// Create a buffer object of `size` bytes.
    ///
    /// The bank is selected from the flags and clamped to the bank
    /// count. Allocation happens locally first; only a successful
    /// allocation is mirrored to the simulator. A zero size is an
    /// error, and bank exhaustion reports out-of-memory without
    /// contacting the transport.
    pub fn create_buffer(&self, size: u64, flags: u32) -> Result<u32> {
        let mut call = self.begin("create_buffer", format_args!("{size:#x}, {flags:#x}"));
        self.create_buffer_locked(&mut *call, size, flags)
    }

    fn create_buffer_locked(
        &self,
        state: &mut DeviceState,
        size: u64,
        flags: u32,
    ) -> Result<u32> {
        if size == 0 {
            bail!("zero-size buffer creation");
        }

        let mut bank = bank_index(flags) as usize;
        if bank >= state.memory.len() {
            // Out-of-range bank requests land in bank 0.
            bank = 0;
        }

        let transport = self.ensure_transport()?;

        let base = state.memory[bank].alloc(size);
        if base == NULL_ADDR {
            bail!(
                "out of memory: {:#x} bytes exceed the free space of bank {} ({:#x} bytes)",
                size,
                bank,
                state.memory[bank].size()
            );
        }

        let p2p = is_p2p(flags);
        let export_path = if p2p {
            let device_dir = self.supervisor.device_dir();
            if let Err(e) = fs::create_dir_all(device_dir) {
                state.memory[bank].free(base);
                return Err(e).with_context(|| format!("creating {}", device_dir.display()));
            }
            Some(buffer::unique_path(device_dir, &format!("bo{base:x}")))
        } else {
            None
        };

        if let Err(e) = transport.alloc_buffer(
            base,
            size,
            p2p,
            export_path.as_deref().map(|p| p.to_str().unwrap_or("")).unwrap_or(""),
        ) {
            state.memory[bank].free(base);
            return Err(e).context("mirroring allocation to simulator");
        }

        let handle = state.buffers.insert(BufferObject {
            handle: NULL_HANDLE,
            base,
            size,
            flags,
            export_path,
            mapping: None,
            imported_fd: None,
        });
        log::debug!("device {}: buffer {:#x} created at {:#x}", self.index, handle, base);
        Ok(handle)
    }

    /// Free a buffer object. Unknown handles are a no-op so that
    /// double-free client bugs stay harmless.
    pub fn free_buffer(&self, handle: u32) {
        let mut call = self.begin("free_buffer", format_args!("{handle:#x}"));
        let Some(object) = call.buffers.remove(handle) else {
            log::debug!("device {}: free of unknown handle {:#x} ignored", self.index, handle);
            return;
        };

        for manager in &mut call.memory {
            if manager.contains(object.base) {
                manager.free(object.base);
                break;
            }
        }
        if let Some(transport) = self.supervisor.transport() {
            if let Err(e) = transport.free_buffer(object.base) {
                log::warn!("device {}: simulator free failed: {}", self.index, e);
            }
        }
    }

    /// Map a buffer into host memory, returning a page-aligned pointer.
    ///
    /// Peer-to-peer buffers map their persisted backing file; others
    /// get anonymous memory that lives until `unmap_buffer`.
    pub fn map_buffer(&self, handle: u32, for_write: bool) -> Result<*mut u8> {
        let mut call = self.begin("map_buffer", format_args!("{handle:#x}, write={for_write}"));
        Ok(call.buffers.map(handle, for_write)?)
    }

    /// Release exactly the mapping established by `map_buffer`.
    pub fn unmap_buffer(&self, handle: u32) -> Result<()> {
        let mut call = self.begin("unmap_buffer", format_args!("{handle:#x}"));
        Ok(call.buffers.unmap(handle)?)
    }

    /// Blocking chunked transfer between the buffer's host mapping and
    /// its device region. Reports an I/O error if fewer bytes moved
    /// than requested.
    pub fn sync_buffer(
        &self,
        handle: u32,
        direction: SyncDirection,
        size: usize,
        offset: usize,
    ) -> Result<()> {
        let mut call = self.begin(
            "sync_buffer",
            format_args!("{handle:#x}, {direction:?}, {size:#x}, {offset:#x}"),
        );
        let transport = self.transport_or_fail()?;

        let object = call
            .buffers
            .get_mut(handle)
            .ok_or(BufferError::UnknownHandle(handle))?;
        let base = object.base;
        let mapping = object
            .mapping
            .as_mut()
            .ok_or(BufferError::NotMapped(handle))?;

        let moved = match direction {
            SyncDirection::ToDevice => {
                transport.copy_host_to_device(base, mapping.bytes(), size, offset)?
            }
            SyncDirection::FromDevice => {
                transport.copy_device_to_host(mapping.bytes_mut(), base, size, offset)?
            }
        };
        if moved != size as u64 {
            bail!("input/output error: moved {:#x} of {:#x} bytes", moved, size);
        }
        Ok(())
    }

    /// Copy `src[seek..]` into the buffer at its device offset `seek`.
    pub fn write_buffer(&self, handle: u32, src: &[u8], seek: usize) -> Result<u64> {
        let call = self.begin("write_buffer", format_args!("{handle:#x}, {:#x}, {seek:#x}", src.len()));
        let transport = self.transport_or_fail()?;
        let object = call.buffers.get(handle).ok_or(BufferError::UnknownHandle(handle))?;
        let size = src.len().saturating_sub(seek);
        let moved = transport.copy_host_to_device(object.base, src, size, seek)?;
        if moved != size as u64 {
            bail!("input/output error: moved {:#x} of {:#x} bytes", moved, size);
        }
        Ok(moved)
    }

    /// Read the buffer from device offset `skip` into `dst[skip..]`.
    pub fn read_buffer(&self, handle: u32, dst: &mut [u8], skip: usize) -> Result<u64> {
        let call = self.begin("read_buffer", format_args!("{handle:#x}, {:#x}, {skip:#x}", dst.len()));
        let transport = self.transport_or_fail()?;
        let object = call.buffers.get(handle).ok_or(BufferError::UnknownHandle(handle))?;
        let size = dst.len().saturating_sub(skip);
        let moved = transport.copy_device_to_host(dst, object.base, size, skip)?;
        if moved != size as u64 {
            bail!("input/output error: moved {:#x} of {:#x} bytes", moved, size);
        }
        Ok(moved)
    }

    /// Materialize the export file of a peer-to-peer buffer and return
    /// a descriptor another session can import.
    pub fn export_buffer(&self, handle: u32) -> Result<RawFd> {
        let mut call = self.begin("export_buffer", format_args!("{handle:#x}"));
        Ok(call.buffers.export(handle)?)
    }

    /// Import a buffer exported by `export_buffer`: a fresh handle of
    /// the same size backed by the same file.
    pub fn import_buffer(&self, fd: RawFd, flags: u32) -> Result<u32> {
        let mut call = self.begin("import_buffer", format_args!("{fd}, {flags:#x}"));
        let (path, size) = call.buffers.lookup_export(fd)?;

        let handle = self.create_buffer_locked(&mut *call, size, flags)?;
        let transport = self.transport_or_fail()?;

        let object = call.buffers.get_mut(handle).expect("created above");
        object.export_path = Some(path.clone());
        object.imported_fd = Some(fd);
        let base = object.base;

        if let Err(e) = transport.import_buffer(&path.display().to_string(), base, size) {
            let object = call.buffers.remove(handle).expect("created above");
            for manager in &mut call.memory {
                if manager.contains(object.base) {
                    manager.free(object.base);
                    break;
                }
            }
            return Err(e).context("importing buffer into simulator");
        }
        Ok(handle)
    }

    /// Device-to-file copy between two buffers of this session; the
    /// destination must be backed by an export file.
    pub fn copy_buffer(
        &self,
        dst: u32,
        src: u32,
        size: usize,
        dst_offset: u64,
        src_offset: usize,
    ) -> Result<()> {
        let call = self.begin(
            "copy_buffer",
            format_args!("{dst:#x} <- {src:#x}, {size:#x}, {dst_offset:#x}, {src_offset:#x}"),
        );
        let transport = self.transport_or_fail()?;

        let source = call.buffers.get(src).ok_or(BufferError::UnknownHandle(src))?;
        let dest = call.buffers.get(dst).ok_or(BufferError::UnknownHandle(dst))?;
        let dest_path = dest
            .export_path
            .clone()
            .ok_or(BufferError::NotExportable(dst))?;

        let mut staged = vec![0u8; size + src_offset];
        let moved = transport.copy_device_to_host(&mut staged, source.base, size, src_offset)?;
        if moved != size as u64 {
            bail!("input/output error: moved {:#x} of {:#x} bytes", moved, size);
        }

        use std::io::{Seek, SeekFrom};
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&dest_path)
            .with_context(|| format!("opening {}", dest_path.display()))?;
        file.seek(SeekFrom::Start(dst_offset))?;
        file.write_all(&staged[src_offset..src_offset + size])?;
        Ok(())
    }

    /// Static properties of a buffer object.
    pub fn buffer_properties(&self, handle: u32) -> Result<BufferProperties> {
        let call = self.begin("buffer_properties", format_args!("{handle:#x}"));
        Ok(call.buffers.properties(handle)?)
    }

    /// Backing export-file path of a buffer, when it has one.
    pub fn buffer_path(&self, handle: u32) -> Option<PathBuf> {
        let call = self.begin("buffer_path", format_args!("{handle:#x}"));
        call.buffers.get(handle).and_then(|o| o.export_path.clone())
    }

    // ------------------------------------------------------------------
    // Control-register window
    // ------------------------------------------------------------------

    /// Write to the control address space. Only 32-bit-multiple writes
    /// are accepted. Without a channel this is a silent success, so
    /// clients probing an unloaded device degrade gracefully.
    pub fn write_register(&self, offset: u64, data: &[u8]) -> Result<()> {
        let _call = self.begin("write_register", format_args!("{offset:#x}, {:#x}", data.len()));
        if data.len() % 4 != 0 {
            bail!("control writes must be a multiple of 32 bits");
        }
        match self.supervisor.transport() {
            Some(transport) => Ok(transport.write_control(offset, data)?),
            None => Ok(()),
        }
    }

    /// Read one 32-bit word from the control address space.
    pub fn read_register(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        let _call = self.begin("read_register", format_args!("{offset:#x}, {:#x}", data.len()));
        if data.len() != 4 {
            bail!("control reads are exactly 32 bits");
        }
        let Some(transport) = self.supervisor.transport() else {
            return Ok(());
        };
        let bytes = transport.read_control(offset, 4)?;
        if bytes.len() != 4 {
            bail!("short control read: {} bytes", bytes.len());
        }
        data.copy_from_slice(&bytes);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Streaming queues
    // ------------------------------------------------------------------

    /// Create a write queue on the simulator side.
    pub fn create_write_queue(&self) -> Result<u64> {
        let _call = self.begin("create_write_queue", format_args!(""));
        self.create_queue(true)
    }

    /// Create a read queue on the simulator side.
    pub fn create_read_queue(&self) -> Result<u64> {
        let _call = self.begin("create_read_queue", format_args!(""));
        self.create_queue(false)
    }

    fn create_queue(&self, write: bool) -> Result<u64> {
        let transport = self.ensure_transport()?;
        let handle = transport.create_queue(write)?;
        if handle == 0 {
            bail!("unable to create {} queue", if write { "write" } else { "read" });
        }
        Ok(handle)
    }

    pub fn destroy_queue(&self, queue: u64) -> Result<()> {
        let _call = self.begin("destroy_queue", format_args!("{queue:#x}"));
        let transport = self.transport_or_fail()?;
        Ok(transport.destroy_queue(queue)?)
    }

    /// Write `buffers` to a streaming queue.
    ///
    /// A non-blocking request is recorded in the tracker before any
    /// transfer is issued; its completion arrives through
    /// [`Device::poll_completions`] carrying `context`.
    pub fn write_queue(
        &self,
        queue: u64,
        buffers: &[&[u8]],
        context: usize,
        nonblocking: bool,
    ) -> Result<u64> {
        let mut call = self.begin(
            "write_queue",
            format_args!("{queue:#x}, {} buffer(s), nb={nonblocking}", buffers.len()),
        );
        let transport = self.transport_or_fail()?;

        let id = call.queues.begin_request();
        if nonblocking {
            let spans: BTreeMap<u64, u64> = buffers
                .iter()
                .map(|b| (b.as_ptr() as u64, b.len() as u64))
                .collect();
            call.queues.record(id, context, spans);
        }

        let mut total = 0u64;
        for data in buffers {
            total += transport.write_queue(queue, data)?;
        }
        Ok(total)
    }

    /// Read from a streaming queue into `buffers`.
    ///
    /// Blocking reads retry each buffer until the simulator reports a
    /// non-zero count; non-blocking reads take whatever is available
    /// and rely on completion polling.
    pub fn read_queue(
        &self,
        queue: u64,
        buffers: &mut [&mut [u8]],
        context: usize,
        nonblocking: bool,
    ) -> Result<u64> {
        let mut call = self.begin(
            "read_queue",
            format_args!("{queue:#x}, {} buffer(s), nb={nonblocking}", buffers.len()),
        );
        let transport = self.transport_or_fail()?;

        let id = call.queues.begin_request();
        if nonblocking {
            let spans: BTreeMap<u64, u64> = buffers
                .iter()
                .map(|b| (b.as_ptr() as u64, b.len() as u64))
                .collect();
            call.queues.record(id, context, spans);
        }

        let mut total = 0u64;
        for data in buffers.iter_mut() {
            loop {
                let read = transport.read_queue(queue, data)?;
                total += read;
                if read > 0 || nonblocking {
                    break;
                }
            }
        }
        Ok(total)
    }

    /// Poll for completions of non-blocking queue requests.
    ///
    /// Returns immediately when `min` is zero. Otherwise the loop
    /// blocks until at least `min` requests are satisfied; the timeout
    /// parameter is accepted for interface compatibility but does not
    /// bound the wait. At most `max` completions are returned; each
    /// satisfied request is removed from the outstanding set exactly
    /// once and reported with its original context.
    pub fn poll_completions(
        &self,
        min: usize,
        max: usize,
        _timeout_ms: i32,
    ) -> Result<Vec<Completion>> {
        let mut call = self.begin("poll_completions", format_args!("{min}, {max}"));
        let transport = self.transport_or_fail()?;

        let mut completions = Vec::new();
        while completions.len() < min {
            let batch = call.queues.poll_pass(max - completions.len(), |request| {
                let spans: Vec<(u64, u64)> =
                    request.spans.iter().map(|(&va, &len)| (va, len)).collect();
                transport.poll_completion(request.id, &spans)
            })?;
            completions.extend(batch);
            if completions.len() < min {
                std::thread::yield_now();
            }
        }
        Ok(completions)
    }

    // ------------------------------------------------------------------
    // Session info and teardown
    // ------------------------------------------------------------------

    /// Session information, including summed free bank memory.
    pub fn info(&self) -> DeviceInfo {
        let call = self.begin("info", format_args!(""));
        DeviceInfo {
            ddr_size: call.memory.iter().map(|m| m.size()).sum(),
            bank_count: call.memory.len(),
            ddr_free_size: call.memory.iter().map(|m| m.free_size()).sum(),
        }
    }

    /// Close the session: release host state, tell the simulator,
    /// reap the child and remove the run directory unless it is being
    /// kept.
    ///
    /// Teardown blocks until the child process has exited.
    pub fn close(&self) {
        {
            let mut call = self.begin("close", format_args!(""));
            call.buffers.release_host_state();
            call.queues = QueueTracker::new();
        }

        if let Some(transport) = self.supervisor.transport() {
            // A never-connected channel has no peer to notify.
            if transport.channel().is_connected() {
                if let Err(e) = transport.close_session() {
                    log::warn!("device {}: close call failed: {}", self.index, e);
                }
            }
            self.record.save_outputs_to(
                &std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            );
            self.supervisor.teardown();
        }

        if !self.config.keep_run_dir() {
            self.supervisor.remove_run_dir();
        }
        log::info!("device {} closed", self.index);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        crash::unregister(self.index);
        let mut state = self.state.lock().expect("device lock poisoned");
        if let Some(window) = state.command_window.as_mut() {
            if let Err(e) = window.send_reset() {
                log::warn!("device {}: launcher reset failed: {}", self.index, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::stub_peer;
    use crate::transport::{Channel, Request, Response};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc::Receiver;
    use std::thread::JoinHandle;

    const KB: u64 = 1024;

    fn dont_run_config(root: &std::path::Path) -> Config {
        Config {
            dont_run: Some(true),
            run_dir: Some(root.display().to_string()),
            ..Config::default()
        }
    }

    /// A device wired to a scripted stub simulator over a socket pair.
    fn stub_device<F>(
        root: &std::path::Path,
        index: u32,
        banks: &[DdrBank],
        message_size: u64,
        reply: F,
    ) -> (Device, Receiver<Request>, JoinHandle<()>)
    where
        F: Fn(&Request) -> Option<Response> + Send + 'static,
    {
        let device = Device::open_with_config(index, banks, dont_run_config(root)).unwrap();
        let (ours, theirs) = UnixStream::pair().unwrap();
        let (rx, handle) = stub_peer(theirs, reply);
        let transport = Arc::new(Transport::new(Channel::from_stream(ours), message_size));
        device.supervisor.install_transport(transport);
        (device, rx, handle)
    }

    /// Stub with a byte-addressed device memory behind it.
    fn memory_stub() -> impl Fn(&Request) -> Option<Response> + Send + 'static {
        let memory = Mutex::new(BTreeMap::<u64, u8>::new());
        move |request| match request {
            Request::WriteDevice { addr, data } => {
                let mut memory = memory.lock().unwrap();
                for (i, byte) in data.iter().enumerate() {
                    memory.insert(addr + i as u64, *byte);
                }
                Some(Response::Ack(true))
            }
            Request::ReadDevice { addr, len } => {
                let memory = memory.lock().unwrap();
                let data = (0..*len)
                    .map(|i| memory.get(&(addr + i)).copied().unwrap_or(0))
                    .collect();
                Some(Response::Data(data))
            }
            Request::AllocBuffer { .. }
            | Request::FreeBuffer { .. }
            | Request::ImportBuffer { .. }
            | Request::LoadBitstream { .. }
            | Request::LoadContent { .. }
            | Request::SetupInstance { .. }
            | Request::Close => Some(Response::Ack(true)),
            Request::CreateQueue { .. } => Some(Response::Value(1)),
            Request::WriteQueue { data, .. } => Some(Response::Value(data.len() as u64)),
            _ => Some(Response::Ack(true)),
        }
    }

    #[test]
    fn zero_size_creation_fails_without_touching_the_transport() {
        let root = tempfile::tempdir().unwrap();
        let (device, rx, handle) =
            stub_device(root.path(), 20, &[DdrBank::new(64 * KB)], 1024, memory_stub());

        assert!(device.create_buffer(0, 0).is_err());
        drop(device);
        handle.join().unwrap();
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn exhaustion_reports_out_of_memory_without_transport_call() {
        let root = tempfile::tempdir().unwrap();
        let (device, rx, handle) =
            stub_device(root.path(), 21, &[DdrBank::new(64 * KB)], 1024, memory_stub());

        let before = device.info().ddr_free_size;
        let err = device.create_buffer(128 * KB, 0).unwrap_err();
        assert!(err.to_string().contains("out of memory"));
        assert_eq!(device.info().ddr_free_size, before);

        drop(device);
        handle.join().unwrap();
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn bank_selection_clamps_out_of_range_indices() {
        let root = tempfile::tempdir().unwrap();
        let (device, _rx, handle) = stub_device(
            root.path(),
            22,
            &[DdrBank::new(64 * KB), DdrBank::new(64 * KB)],
            1024,
            memory_stub(),
        );

        let in_bank_1 = device.create_buffer(4 * KB, 1).unwrap();
        let props = device.buffer_properties(in_bank_1).unwrap();
        assert!(props.paddr >= 64 * KB);

        // Bank 9 does not exist; the request lands in bank 0.
        let clamped = device.create_buffer(4 * KB, 9).unwrap();
        let props = device.buffer_properties(clamped).unwrap();
        assert!(props.paddr < 64 * KB);

        drop(device);
        handle.join().unwrap();
    }

    #[test]
    fn generic_allocation_walks_banks_in_order() {
        let root = tempfile::tempdir().unwrap();
        let (device, _rx, handle) = stub_device(
            root.path(),
            35,
            &[DdrBank::new(64 * KB), DdrBank::new(64 * KB)],
            1024,
            memory_stub(),
        );

        let a = device.alloc_device_memory(48 * KB).unwrap();
        assert!(a < 64 * KB);
        // 32 KiB no longer fits bank 0, so bank 1 takes it.
        let b = device.alloc_device_memory(32 * KB).unwrap();
        assert!(b >= 64 * KB);
        assert!(device.alloc_device_memory(128 * KB).is_err());

        device.free_device_memory(a);
        device.free_device_memory(b);
        device.free_device_memory(0xFFFF_0000); // outside every bank
        assert_eq!(device.info().ddr_free_size, 128 * KB);

        drop(device);
        handle.join().unwrap();
    }

    #[test]
    fn free_of_unknown_handle_is_a_noop() {
        let root = tempfile::tempdir().unwrap();
        let (device, _rx, handle) =
            stub_device(root.path(), 23, &[DdrBank::new(64 * KB)], 1024, memory_stub());

        device.free_buffer(0xDEAD);
        let bo = device.create_buffer(4 * KB, 0).unwrap();
        device.free_buffer(bo);
        device.free_buffer(bo); // double free stays harmless
        assert_eq!(device.info().ddr_free_size, 64 * KB);

        drop(device);
        handle.join().unwrap();
    }

    #[test]
    fn mapped_buffer_syncs_both_directions() {
        let root = tempfile::tempdir().unwrap();
        let (device, _rx, handle) = stub_device(
            root.path(),
            24,
            &[DdrBank::new(256 * KB)],
            // Small threshold: the 12 KiB sync below must chunk.
            4 * KB,
            memory_stub(),
        );

        let bo = device.create_buffer(12 * KB, 0).unwrap();
        let ptr = device.map_buffer(bo, true).unwrap();
        let host = unsafe { std::slice::from_raw_parts_mut(ptr, 12 * KB as usize) };
        for (i, byte) in host.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        device.sync_buffer(bo, SyncDirection::ToDevice, 12 * KB as usize, 0).unwrap();
        host.fill(0);
        device.sync_buffer(bo, SyncDirection::FromDevice, 12 * KB as usize, 0).unwrap();

        for (i, byte) in host.iter().enumerate() {
            assert_eq!(*byte, (i % 251) as u8, "byte {i} corrupted");
        }

        device.unmap_buffer(bo).unwrap();
        drop(device);
        handle.join().unwrap();
    }

    #[test]
    fn write_then_read_buffer_round_trips_with_seek() {
        let root = tempfile::tempdir().unwrap();
        let (device, _rx, handle) =
            stub_device(root.path(), 25, &[DdrBank::new(64 * KB)], 7, memory_stub());

        let bo = device.create_buffer(4 * KB, 0).unwrap();
        let mut src = vec![0u8; 100];
        for (i, byte) in src.iter_mut().enumerate() {
            *byte = i as u8;
        }
        // Write bytes 10.. at device offset 10.
        assert_eq!(device.write_buffer(bo, &src, 10).unwrap(), 90);

        let mut dst = vec![0u8; 100];
        assert_eq!(device.read_buffer(bo, &mut dst, 10).unwrap(), 90);
        assert_eq!(&dst[10..], &src[10..]);

        drop(device);
        handle.join().unwrap();
    }

    #[test]
    fn export_import_round_trip_preserves_size_and_path() {
        let root = tempfile::tempdir().unwrap();
        let (device, _rx, handle) =
            stub_device(root.path(), 26, &[DdrBank::new(256 * KB)], 1024, memory_stub());

        let original = device.create_buffer(8 * KB, FLAG_P2P).unwrap();
        let fd = device.export_buffer(original).unwrap();

        let imported = device.import_buffer(fd, 0).unwrap();
        assert_ne!(imported, original);

        let original_props = device.buffer_properties(original).unwrap();
        let imported_props = device.buffer_properties(imported).unwrap();
        assert_eq!(imported_props.size, original_props.size);
        assert_eq!(device.buffer_path(imported), device.buffer_path(original));

        drop(device);
        handle.join().unwrap();
    }

    #[test]
    fn export_of_plain_buffer_fails() {
        let root = tempfile::tempdir().unwrap();
        let (device, _rx, handle) =
            stub_device(root.path(), 27, &[DdrBank::new(64 * KB)], 1024, memory_stub());

        let plain = device.create_buffer(4 * KB, 0).unwrap();
        assert!(device.export_buffer(plain).is_err());

        drop(device);
        handle.join().unwrap();
    }

    #[test]
    fn queue_poll_blocks_until_min_completions() {
        let root = tempfile::tempdir().unwrap();

        // Requests 0 and 1 complete from their second probe on; request
        // 2 needs a third probe.
        let probes = Mutex::new(BTreeMap::<u64, u64>::new());
        let reply = move |request: &Request| match request {
            Request::CreateQueue { .. } => Some(Response::Value(7)),
            Request::WriteQueue { data, .. } => Some(Response::Value(data.len() as u64)),
            Request::PollCompletion { request_id, spans } => {
                let mut probes = probes.lock().unwrap();
                let count = probes.entry(*request_id).or_insert(0);
                *count += 1;
                let needed = if *request_id < 2 { 2 } else { 3 };
                let total: u64 = spans.iter().map(|(_, len)| len).sum();
                Some(Response::Value(if *count >= needed { total } else { 0 }))
            }
            _ => Some(Response::Ack(true)),
        };
        let (device, _rx, handle) =
            stub_device(root.path(), 28, &[DdrBank::new(64 * KB)], 1024, reply);

        let queue = device.create_write_queue().unwrap();
        let payload = [0u8; 64];
        for context in [11usize, 22, 33] {
            let written = device.write_queue(queue, &[&payload], context, true).unwrap();
            assert_eq!(written, 64);
        }

        // min=0 returns immediately, leaving everything outstanding.
        assert!(device.poll_completions(0, 16, 0).unwrap().is_empty());

        let done = device.poll_completions(2, 16, 0).unwrap();
        assert_eq!(done.len(), 2);
        let contexts: Vec<usize> = done.iter().map(|c| c.context).collect();
        assert!(contexts.contains(&11) && contexts.contains(&22));
        assert!(done.iter().all(|c| c.bytes == 64));

        // The remaining request completes later and only once.
        let done = device.poll_completions(1, 16, 0).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].context, 33);
        assert!(device.poll_completions(0, 16, 0).unwrap().is_empty());

        drop(device);
        handle.join().unwrap();
    }

    fn image_with_topology(conn_rows: &[(i32, i32, i32)]) -> Vec<u8> {
        use crate::xclbin::container::tests::build_container;
        use crate::xclbin::topology::tests::{build_connectivity, build_mem_topology};

        let xml = r#"<project name="p"><platform><device><core/></device></platform></project>"#;
        let topology = build_mem_topology(&[
            (1, 0x10000, 0, "DDR[0]"),
            (3, 5, 0x1_0001, "in0"),
            (3, 6, 0x1_0002, "out0"),
            (3, 7, 0x2_0001, "in1"),
        ]);
        let connectivity = build_connectivity(conn_rows);
        build_container(&[
            (2, xml.as_bytes()),
            (0, b"fake-bitstream"),
            (6, &topology),
            (7, &connectivity),
        ])
    }

    #[test]
    fn load_binary_stages_files_and_groups_instances() {
        let root = tempfile::tempdir().unwrap();
        let (device, rx, handle) = stub_device(
            root.path(),
            29,
            &[DdrBank::new(64 * KB)],
            1024,
            memory_stub(),
        );

        // Streaming args on two instances plus one DDR row.
        let image = image_with_topology(&[(0, 0, 1), (1, 0, 2), (0, 0, 3), (2, 0, 0)]);
        device.load_binary(&image).unwrap();
        drop(device);
        handle.join().unwrap();

        let requests: Vec<Request> = rx.try_iter().collect();
        let setups: Vec<&Request> = requests
            .iter()
            .filter(|r| matches!(r, Request::SetupInstance { .. }))
            .collect();
        // Instances 0x10000 (two args), 0x20000 (one arg), 0x0 (DDR row).
        assert_eq!(setups.len(), 3);
        let Request::SetupInstance { instance_base, args } = setups[0] else { panic!() };
        assert_eq!((*instance_base, args.len()), (0x1_0000, 2));
        let Request::SetupInstance { instance_base, args } = setups[1] else { panic!() };
        assert_eq!((*instance_base, args.len()), (0x2_0000, 1));
        let Request::SetupInstance { args, .. } = setups[2] else { panic!() };
        assert!(args.is_empty());

        let load = requests.iter().find_map(|r| match r {
            Request::LoadBitstream { xml_path, bitstream_path, binary_dir, .. } => {
                Some((xml_path.clone(), bitstream_path.clone(), binary_dir.clone()))
            }
            _ => None,
        });
        let (xml_path, bitstream_path, binary_dir) = load.expect("load call sent");
        assert!(binary_dir.ends_with("binary_0"));
        assert!(!fs::read(&xml_path).unwrap().is_empty());
        assert_eq!(fs::read(&bitstream_path).unwrap(), b"fake-bitstream");
    }

    #[test]
    fn out_of_range_connectivity_fails_load_with_no_setup_calls() {
        let root = tempfile::tempdir().unwrap();
        let (device, rx, handle) =
            stub_device(root.path(), 30, &[DdrBank::new(64 * KB)], 1024, memory_stub());

        // mem_data_index 9 exceeds the 4-row topology.
        let image = image_with_topology(&[(0, 0, 1), (1, 0, 9)]);
        let err = device.load_binary(&image).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        drop(device);
        handle.join().unwrap();
        let requests: Vec<Request> = rx.try_iter().collect();
        assert!(
            !requests.iter().any(|r| matches!(
                r,
                Request::SetupInstance { .. } | Request::LoadBitstream { .. }
            )),
            "no call may be committed after a bad index: {requests:?}"
        );
    }

    #[test]
    fn legacy_and_garbled_magics_fail_the_load() {
        let root = tempfile::tempdir().unwrap();
        let (device, _rx, handle) =
            stub_device(root.path(), 31, &[DdrBank::new(64 * KB)], 1024, memory_stub());

        let mut legacy = vec![0u8; 1024];
        legacy[..7].copy_from_slice(b"xclbin1");
        assert!(device.load_binary(&legacy).is_err());

        let mut garbled = vec![0u8; 1024];
        garbled[..8].copy_from_slice(b"not-an-i");
        assert!(device.load_binary(&garbled).is_err());

        drop(device);
        handle.join().unwrap();
    }

    #[test]
    fn generation_directories_advance_per_load() {
        let root = tempfile::tempdir().unwrap();
        let (device, rx, handle) =
            stub_device(root.path(), 32, &[DdrBank::new(64 * KB)], 1024, memory_stub());

        let image = image_with_topology(&[]);
        device.load_binary(&image).unwrap();
        device.load_binary(&image).unwrap();
        drop(device);
        handle.join().unwrap();

        let dirs: Vec<String> = rx
            .try_iter()
            .filter_map(|r| match r {
                Request::LoadBitstream { binary_dir, .. } => Some(binary_dir),
                _ => None,
            })
            .collect();
        assert_eq!(dirs.len(), 2);
        assert!(dirs[0].ends_with("binary_0"));
        assert!(dirs[1].ends_with("binary_1"));
    }

    #[test]
    fn close_notifies_simulator_and_removes_run_dir() {
        let root = tempfile::tempdir().unwrap();
        let (device, rx, handle) =
            stub_device(root.path(), 33, &[DdrBank::new(64 * KB)], 1024, memory_stub());

        let bo = device.create_buffer(4 * KB, 0).unwrap();
        let _ = device.map_buffer(bo, true).unwrap();
        let device_dir = device.supervisor.device_dir().to_path_buf();

        device.close();
        assert!(!device_dir.exists());

        drop(device);
        handle.join().unwrap();
        assert!(rx.try_iter().any(|r| matches!(r, Request::Close)));
    }

    #[test]
    fn call_counter_hooks_fire_at_api_boundaries() {
        static ENTERS: AtomicU64 = AtomicU64::new(0);
        static EXITS: AtomicU64 = AtomicU64::new(0);
        fn hook(_api: &'static str, entering: bool) {
            if entering {
                ENTERS.fetch_add(1, Ordering::SeqCst);
            } else {
                EXITS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let root = tempfile::tempdir().unwrap();
        let (device, _rx, handle) =
            stub_device(root.path(), 34, &[DdrBank::new(64 * KB)], 1024, memory_stub());
        device.set_hooks(ApiHooks { call_boundary: Some(hook) });

        let _ = device.info();
        let bo = device.create_buffer(4 * KB, 0).unwrap();
        device.free_buffer(bo);

        assert_eq!(ENTERS.load(Ordering::SeqCst), 3);
        assert_eq!(EXITS.load(Ordering::SeqCst), 3);

        drop(device);
        handle.join().unwrap();
    }
}
