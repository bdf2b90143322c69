use crate::alloc::{DataAddr, SlotAllocator};
use crate::cache::PageCache;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::page::Page;
use crate::storage::Storage;
use crate::types::{KeyKind, ValueKind};

/// Value-storage strategy of a tree. `Inline` keeps the fixed-length value
/// bytes in the leaf slot itself (the clustered tree); `Spill` appends them
/// to the shared file's data region and stores a packed address in the slot
/// (the unclustered tree).
///
/// `store`/`load` move one leaf entry's worth of bytes; chunking a large
/// value into page-sized pieces is the tree core's job.
pub trait ValueMode {
	/// Metadata tag identifying the strategy a file was created with.
	const TAG: u8;
	/// Whether inserting an existing key overwrites in place. When false,
	/// equal keys accumulate as separate entries (which is what makes
	/// value chunking work).
	const OVERWRITE: bool;
	/// Whether this strategy consumes data pages from the shared file.
	const HAS_DATA_REGION: bool;

	fn new(opts: &Options) -> Self;

	fn check_key_kind(kind: KeyKind) -> Result<()>;

	fn check_value_kind(kind: ValueKind) -> Result<()>;

	/// Width of one encoded value slot in a leaf, given the locked-in
	/// encoded value width.
	fn slot_width(value_width: usize) -> usize;

	/// Largest number of value bytes one leaf entry can carry, if bounded.
	fn max_chunk(page_size: usize) -> Option<usize>;

	fn store<F: Storage>(
		&mut self,
		chunk: &[u8],
		alloc: &mut SlotAllocator,
		file: &mut F,
	) -> Result<Vec<u8>>;

	fn load<F: Storage>(&mut self, slot: &[u8], file: &mut F) -> Result<Vec<u8>>;

	fn sync<F: Storage>(&mut self, file: &mut F) -> Result<()>;

	fn flush<F: Storage>(&mut self, file: &mut F) -> Result<()>;
}

/// Clustered storage: the leaf slot is the value.
pub struct Inline;

impl ValueMode for Inline {
	const TAG: u8 = 1;
	const OVERWRITE: bool = true;
	const HAS_DATA_REGION: bool = false;

	fn new(_opts: &Options) -> Self {
		Inline
	}

	fn check_key_kind(_kind: KeyKind) -> Result<()> {
		Ok(())
	}

	fn check_value_kind(kind: ValueKind) -> Result<()> {
		match kind {
			ValueKind::Str => Err(Error::UnsupportedType(
				"the clustered tree stores fixed-length values; strings are not supported".into(),
			)),
			_ => Ok(()),
		}
	}

	fn slot_width(value_width: usize) -> usize {
		value_width
	}

	fn max_chunk(_page_size: usize) -> Option<usize> {
		None
	}

	fn store<F: Storage>(
		&mut self,
		chunk: &[u8],
		_alloc: &mut SlotAllocator,
		_file: &mut F,
	) -> Result<Vec<u8>> {
		Ok(chunk.to_vec())
	}

	fn load<F: Storage>(&mut self, slot: &[u8], _file: &mut F) -> Result<Vec<u8>> {
		Ok(slot.to_vec())
	}

	fn sync<F: Storage>(&mut self, _file: &mut F) -> Result<()> {
		Ok(())
	}

	fn flush<F: Storage>(&mut self, _file: &mut F) -> Result<()> {
		Ok(())
	}
}

/// Unclustered storage: value bytes go to the append-only data region
/// through a write-back page cache of their own; the leaf slot holds the
/// packed `(page, offset, len)` address.
pub struct Spill {
	cache: PageCache,
	page_size: usize,
}

impl Spill {
	fn page_mut<'c, F: Storage>(
		&'c mut self,
		page_no: u32,
		file: &mut F,
		create: bool,
	) -> Result<&'c mut Page> {
		if self.cache.get(page_no, self.page_size, file)?.is_none() {
			if !create {
				return Err(Error::Corruption(format!(
					"data page {page_no} referenced but never written"
				)));
			}
			self.cache.insert(page_no, Page::new_raw(self.page_size), file)?;
		}
		// re-borrow; the page is resident now
		Ok(self
			.cache
			.get(page_no, self.page_size, file)?
			.expect("data page was just cached"))
	}
}

impl ValueMode for Spill {
	const TAG: u8 = 2;
	const OVERWRITE: bool = false;
	const HAS_DATA_REGION: bool = true;

	fn new(opts: &Options) -> Self {
		Spill {
			cache: PageCache::new(opts.data_cache_capacity, opts.cache_factor),
			page_size: opts.page_size,
		}
	}

	fn check_key_kind(kind: KeyKind) -> Result<()> {
		match kind {
			KeyKind::Float64 => Err(Error::UnsupportedType(
				"the unclustered tree does not index float64 keys".into(),
			)),
			_ => Ok(()),
		}
	}

	fn check_value_kind(kind: ValueKind) -> Result<()> {
		match kind {
			ValueKind::Float64 => Err(Error::UnsupportedType(
				"the unclustered tree does not store float64 values".into(),
			)),
			_ => Ok(()),
		}
	}

	fn slot_width(_value_width: usize) -> usize {
		8
	}

	fn max_chunk(page_size: usize) -> Option<usize> {
		Some(page_size)
	}

	fn store<F: Storage>(
		&mut self,
		chunk: &[u8],
		alloc: &mut SlotAllocator,
		file: &mut F,
	) -> Result<Vec<u8>> {
		let addr = alloc.alloc_data(chunk.len() as u32);
		let page = self.page_mut(addr.page, file, true)?;
		page.write_extent(addr.offset, chunk);
		Ok(addr.pack(self.page_size).to_be_bytes().to_vec())
	}

	fn load<F: Storage>(&mut self, slot: &[u8], file: &mut F) -> Result<Vec<u8>> {
		let raw = u64::from_be_bytes(
			slot.try_into()
				.map_err(|_| Error::Corruption("data address slot is not 8 bytes".into()))?,
		);
		let addr = DataAddr::unpack(raw, self.page_size);
		let page = self.page_mut(addr.page, file, false)?;
		Ok(page.extent(addr.offset, addr.len)?.to_vec())
	}

	fn sync<F: Storage>(&mut self, file: &mut F) -> Result<()> {
		self.cache.sync(file)
	}

	fn flush<F: Storage>(&mut self, file: &mut F) -> Result<()> {
		self.cache.flush_all(file)
	}
}
