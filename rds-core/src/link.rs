//! Transport abstraction shared by every board
//!
//! A [`Link`] moves bytes (byte-stream boards) or 32-bit register values
//! (memory-mapped boards). Transport setup such as baud rate or BAR mapping is
//! done before the link is handed to the core; the core only needs to be able
//! to close and reopen it after a failure.

use crate::error::LinkError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Blocking, exclusively owned transport to a board
pub trait Link {
    /// Write all bytes in order
    fn write(&mut self, bytes: &[u8]) -> LinkResult<()>;

    /// Fill `buf` completely
    fn read(&mut self, buf: &mut [u8]) -> LinkResult<()>;

    /// Write a 32-bit register
    fn write_register(&mut self, addr: u32, value: u32) -> LinkResult<()> {
        let _ = (addr, value);
        Err(LinkError::Unsupported("register writes"))
    }

    /// Read a 32-bit register
    fn read_register(&mut self, addr: u32) -> LinkResult<u32> {
        let _ = addr;
        Err(LinkError::Unsupported("register reads"))
    }

    /// Close and reopen the underlying transport
    fn reopen(&mut self) -> LinkResult<()>;
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn write(&mut self, bytes: &[u8]) -> LinkResult<()> {
        (**self).write(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> LinkResult<()> {
        (**self).read(buf)
    }

    fn write_register(&mut self, addr: u32, value: u32) -> LinkResult<()> {
        (**self).write_register(addr, value)
    }

    fn read_register(&mut self, addr: u32) -> LinkResult<u32> {
        (**self).read_register(addr)
    }

    fn reopen(&mut self) -> LinkResult<()> {
        (**self).reopen()
    }
}

/// Serial device node opened as a plain file
///
/// Line discipline (baud rate, raw mode, character timeout) must already be
/// configured on the node, e.g. with `stty`.
pub struct SerialLink {
    path: PathBuf,
    file: Option<File>,
}

impl SerialLink {
    pub fn open(path: impl Into<PathBuf>) -> LinkResult<Self> {
        let path = path.into();
        let file = Self::open_node(&path)?;
        debug!("Opened serial device {}", path.display());
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    fn open_node(path: &PathBuf) -> LinkResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(LinkError::Io)
    }

    fn file(&mut self) -> LinkResult<&mut File> {
        self.file.as_mut().ok_or(LinkError::Disconnected)
    }
}

impl Link for SerialLink {
    fn write(&mut self, bytes: &[u8]) -> LinkResult<()> {
        let file = self.file()?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> LinkResult<()> {
        self.file()?.read_exact(buf)?;
        Ok(())
    }

    fn reopen(&mut self) -> LinkResult<()> {
        self.file = None;
        match Self::open_node(&self.path) {
            Ok(file) => {
                self.file = Some(file);
                debug!("Reopened serial device {}", self.path.display());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to reopen {}: {}", self.path.display(), e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    #[test]
    fn test_serial_link_on_regular_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1, 2, 3, 4]).unwrap();
        tmp.flush().unwrap();
        tmp.rewind().unwrap();

        let mut link = SerialLink::open(tmp.path()).unwrap();
        let mut buf = [0u8; 4];
        link.read(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        // short read surfaces as an I/O error
        assert!(matches!(link.read(&mut buf), Err(LinkError::Io(_))));

        link.reopen().unwrap();
        link.read(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        assert!(matches!(
            link.read_register(0),
            Err(LinkError::Unsupported(_))
        ));
    }
}
