use std::fs::File as SysFile;

use crate::error::{Error, Result};

/// Random-access reads over a table file. Readers share one handle across
/// threads, so reads are positional and never move a cursor.
pub trait File: Send + Sync {
	fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

	fn size(&self) -> Result<u64>;

	/// Fills `buf` completely or fails with `Corruption` on a short read.
	fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
		let mut filled = 0;
		while filled < buf.len() {
			let n = self.read_at(offset + filled as u64, &mut buf[filled..])?;
			if n == 0 {
				return Err(Error::Corruption(format!(
					"short read at offset {}: wanted {} bytes, got {}",
					offset,
					buf.len(),
					filled
				)));
			}
			filled += n;
		}
		Ok(())
	}
}

pub type InMemoryFile = Vec<u8>;

impl File for InMemoryFile {
	fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
		let start = (offset as usize).min(self.len());
		let end = std::cmp::min(start + buf.len(), self.len());
		let bytes_read = end - start;
		buf[..bytes_read].copy_from_slice(&self[start..end]);
		Ok(bytes_read)
	}

	fn size(&self) -> Result<u64> {
		Ok(self.len() as u64)
	}
}

impl File for SysFile {
	fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
		#[cfg(unix)]
		{
			std::os::unix::prelude::FileExt::read_at(self, buf, offset)
				.map_err(|e| Error::Io(e.into()))
		}

		#[cfg(windows)]
		{
			std::os::windows::prelude::FileExt::seek_read(self, buf, offset)
				.map_err(|e| Error::Io(e.into()))
		}
	}

	fn size(&self) -> Result<u64> {
		match SysFile::metadata(self) {
			Ok(v) => Ok(v.len()),
			Err(e) => Err(Error::Io(e.into())),
		}
	}
}
