//! Host tap devices used as punt sinks.

use crate::error::Result;
use crate::punt::PuntSink;
use std::fs::File;
use std::io::Write;

/// An attached tap device (`IFF_TAP | IFF_NO_PI`).
#[derive(Debug)]
pub struct TapDevice {
    name: String,
    file: File,
}

impl TapDevice {
    /// Attaches to (or creates) the named tap device.
    pub fn open(name: &str) -> Result<Self> {
        let file = sys::tap_alloc(name)?;
        tracing::info!(tap = name, "Attached tap device");
        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PuntSink for TapDevice {
    fn write_packet(&self, packet: &[u8]) -> std::io::Result<usize> {
        (&self.file).write(packet)
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use crate::error::{AfisyncError, Result};
    use std::fs::{File, OpenOptions};
    use std::os::fd::AsRawFd;

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TAP: libc::c_short = 0x0002;
    const IFF_NO_PI: libc::c_short = 0x1000;

    /// `struct ifreq` with the flags member of the union.
    #[repr(C)]
    struct IfReq {
        name: [u8; libc::IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    pub fn tap_alloc(name: &str) -> Result<File> {
        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(AfisyncError::Config(format!(
                "tap name {:?} must be 1 to {} bytes",
                name,
                libc::IFNAMSIZ - 1
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        req.name[..name.len()].copy_from_slice(name.as_bytes());

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
        if ret < 0 {
            return Err(AfisyncError::Io(std::io::Error::last_os_error()));
        }
        Ok(file)
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use crate::error::{AfisyncError, Result};
    use std::fs::File;

    pub fn tap_alloc(name: &str) -> Result<File> {
        Err(AfisyncError::InterfaceNotFound(format!(
            "{}: tap devices are not supported on this platform",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_rejects_long_name() {
        let err = TapDevice::open("a-name-that-is-far-too-long").unwrap_err();
        assert!(matches!(err, crate::error::AfisyncError::Config(_)));
    }
}
