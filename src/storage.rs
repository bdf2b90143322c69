use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Page-granular storage for one tree instance. The buffer length passed to
/// `read_page`/`write_page` is the tree's page size; offsets are derived
/// from it, so the store itself stays geometry-free.
///
/// Next to the page file every tree keeps a small metadata side-channel,
/// written once on close and read back on open.
pub trait Storage {
	/// Read one whole page. Returns `Ok(false)` when the page lies wholly
	/// beyond the end of the store (a never-written page); a torn page in
	/// the middle of the store is an I/O error.
	fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<bool>;

	/// Write one whole page at its slot, extending the store if needed.
	fn write_page(&mut self, page_no: u32, buf: &[u8]) -> Result<()>;

	/// Flush written pages to stable storage.
	fn sync(&mut self) -> Result<()>;

	fn read_meta(&self) -> Result<Option<Vec<u8>>>;

	fn write_meta(&mut self, data: &[u8]) -> Result<()>;

	fn len(&self) -> Result<u64>;

	fn is_empty(&self) -> Result<bool> {
		Ok(self.len()? == 0)
	}
}

/// Disk-based storage: one random-access page file plus a `<path>.meta`
/// side-file.
pub struct DiskStorage {
	file: File,
	meta_path: PathBuf,
}

fn meta_path_for(path: &Path) -> PathBuf {
	let mut os = path.as_os_str().to_os_string();
	os.push(".meta");
	PathBuf::from(os)
}

impl DiskStorage {
	/// Create a fresh page file, truncating any previous tree at this path
	/// (and its stale metadata).
	pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
		let path = path.as_ref();
		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() {
				std::fs::create_dir_all(parent)?;
			}
		}
		let file =
			OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
		let meta_path = meta_path_for(path);
		if meta_path.exists() {
			std::fs::remove_file(&meta_path)?;
		}
		Ok(Self {
			file,
			meta_path,
		})
	}

	/// Open an existing page file.
	pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
		let path = path.as_ref();
		let file = OpenOptions::new().read(true).write(true).open(path)?;
		Ok(Self {
			file,
			meta_path: meta_path_for(path),
		})
	}
}

impl Storage for DiskStorage {
	fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<bool> {
		let offset = page_no as u64 * buf.len() as u64;
		if offset >= self.file.metadata()?.len() {
			return Ok(false);
		}
		self.file.read_exact_at(buf, offset)?;
		Ok(true)
	}

	fn write_page(&mut self, page_no: u32, buf: &[u8]) -> Result<()> {
		let offset = page_no as u64 * buf.len() as u64;
		self.file.write_all_at(buf, offset)?;
		Ok(())
	}

	fn sync(&mut self) -> Result<()> {
		Ok(self.file.sync_all()?)
	}

	fn read_meta(&self) -> Result<Option<Vec<u8>>> {
		if !self.meta_path.exists() {
			return Ok(None);
		}
		Ok(Some(std::fs::read(&self.meta_path)?))
	}

	fn write_meta(&mut self, data: &[u8]) -> Result<()> {
		Ok(std::fs::write(&self.meta_path, data)?)
	}

	fn len(&self) -> Result<u64> {
		Ok(self.file.metadata()?.len())
	}
}

/// In-memory storage, for unit tests.
pub struct MemoryStorage {
	data: Vec<u8>,
	meta: Option<Vec<u8>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		MemoryStorage {
			data: Vec::new(),
			meta: None,
		}
	}
}

impl Default for MemoryStorage {
	fn default() -> Self {
		Self::new()
	}
}

impl Storage for MemoryStorage {
	fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<bool> {
		let start = page_no as usize * buf.len();
		if start >= self.data.len() {
			return Ok(false);
		}
		let end = start + buf.len();
		if end > self.data.len() {
			return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
		}
		buf.copy_from_slice(&self.data[start..end]);
		Ok(true)
	}

	fn write_page(&mut self, page_no: u32, buf: &[u8]) -> Result<()> {
		let start = page_no as usize * buf.len();
		let end = start + buf.len();
		if end > self.data.len() {
			self.data.resize(end, 0);
		}
		self.data[start..end].copy_from_slice(buf);
		Ok(())
	}

	fn sync(&mut self) -> Result<()> {
		Ok(())
	}

	fn read_meta(&self) -> Result<Option<Vec<u8>>> {
		Ok(self.meta.clone())
	}

	fn write_meta(&mut self, data: &[u8]) -> Result<()> {
		self.meta = Some(data.to_vec());
		Ok(())
	}

	fn len(&self) -> Result<u64> {
		Ok(self.data.len() as u64)
	}
}
