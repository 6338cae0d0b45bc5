//! Memory-mapped command window to the external image launcher.
//!
//! The alternate load path does not hand the image to the simulator
//! channel; it writes a command into a fixed physical-address window
//! mapped from a privileged device file, where a separate launcher
//! component picks it up. A command is a length-prefixed buffer written
//! byte-at-a-time, terminated by the end-of-packet marker byte written
//! to the window base.

use anyhow::{Context, Result};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Physical address of the launcher window.
pub const WINDOW_PHYS_ADDR: u64 = 0xA400_0000;

/// Marker byte signalling end-of-packet to the launcher.
pub const PACKET_END_MARKER: u8 = 0x0A;

/// Launcher command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum LauncherCommand {
    LoadImage = 1,
    Reset = 2,
}

/// A mapped launcher command window.
pub struct CommandWindow {
    map: MmapMut,
}

impl CommandWindow {
    /// Map the launcher window from the privileged physical-memory
    /// device. Requires a platform that exposes the launcher.
    pub fn open_device_memory() -> Result<Self> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/mem")
            .context("opening /dev/mem for the launcher window")?;
        Self::map_file(&file, WINDOW_PHYS_ADDR & !(page_size - 1), page_size as usize)
    }

    /// Map a window from an ordinary file. Used on platforms that relay
    /// the window through shared files, and by tests.
    pub fn open_file(path: &Path, offset: u64, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening launcher window {}", path.display()))?;
        Self::map_file(&file, offset, len)
    }

    fn map_file(file: &File, offset: u64, len: usize) -> Result<Self> {
        let map = unsafe { memmap2::MmapOptions::new().offset(offset).len(len).map_mut(file) }
            .context("mapping launcher window")?;
        Ok(Self { map })
    }

    /// Write one command packet into the window.
    ///
    /// Layout: u32 total length, u16 command id, then each argument as a
    /// nul-terminated string. The end marker is written last, over the
    /// window base, which is what the launcher watches.
    pub fn send(&mut self, command: LauncherCommand, args: &[&str]) -> Result<()> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&0u32.to_le_bytes());
        packet.extend_from_slice(&(command as u16).to_le_bytes());
        for arg in args {
            packet.extend_from_slice(arg.as_bytes());
            packet.push(0);
        }
        let total = packet.len() as u32;
        packet[..4].copy_from_slice(&total.to_le_bytes());

        if packet.len() > self.map.len() {
            anyhow::bail!(
                "launcher command of {} bytes exceeds window of {}",
                packet.len(),
                self.map.len()
            );
        }

        // The launcher reads the window concurrently; bytes go out one
        // at a time and the marker is written only once the packet is
        // complete.
        for (i, byte) in packet.iter().enumerate() {
            self.map[i] = *byte;
        }
        self.map[0] = PACKET_END_MARKER;
        self.map.flush().context("flushing launcher window")?;

        log::debug!("launcher command {:?} sent ({} bytes)", command, packet.len());
        Ok(())
    }

    /// Hand an image-load command to the launcher.
    pub fn send_load_image(&mut self, image_name: &str) -> Result<()> {
        self.send(LauncherCommand::LoadImage, &[image_name])
    }

    /// Tell the launcher the session is going away.
    pub fn send_reset(&mut self) -> Result<()> {
        self.send(LauncherCommand::Reset, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn window_file(len: usize) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("window");
        let mut file = File::create(&path).unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        (dir, path)
    }

    #[test]
    fn load_image_command_reaches_the_window() {
        let (_dir, path) = window_file(4096);
        let mut window = CommandWindow::open_file(&path, 0, 4096).unwrap();
        window.send_load_image("vector_add.xclbin").unwrap();
        drop(window);

        let bytes = std::fs::read(&path).unwrap();
        // Marker at the window base.
        assert_eq!(bytes[0], PACKET_END_MARKER);
        // Command id after the length prefix.
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), LauncherCommand::LoadImage as u16);
        // Argument text with its nul terminator.
        let text_at = 6;
        assert_eq!(&bytes[text_at..text_at + 17], b"vector_add.xclbin");
        assert_eq!(bytes[text_at + 17], 0);
    }

    #[test]
    fn oversized_command_is_rejected() {
        let (_dir, path) = window_file(16);
        let mut window = CommandWindow::open_file(&path, 0, 16).unwrap();
        let long_name = "x".repeat(64);
        assert!(window.send_load_image(&long_name).is_err());
    }
}
