use std::collections::BTreeMap;

use lru::LruCache;

use crate::alloc::NodeAddr;
use crate::error::{Error, Result};
use crate::node::{Layout, NodeHandle};
use crate::page::{Page, PAGE_FREE};
use crate::storage::Storage;

/// Write-back cache of raw pages. Overflow evicts a batch from the LRU
/// tail; dirty evictees are gathered and written in ascending page order so
/// the disk sees mostly sequential I/O, clean ones are simply dropped.
///
/// Both the node-page tier and (for unclustered trees) the data-page tier
/// are instances of this one structure.
pub(crate) struct PageCache {
	map: LruCache<u32, Page>,
	capacity: usize,
	discard: usize,
}

impl PageCache {
	pub fn new(capacity: usize, cache_factor: f32) -> PageCache {
		let discard = ((capacity as f32) * (1.0 - cache_factor)) as usize;
		PageCache {
			map: LruCache::unbounded(),
			capacity,
			discard: discard.max(1),
		}
	}

	/// Fetch a page, faulting it in from storage on a miss. `Ok(None)`
	/// means the page has never been written.
	pub fn get<F: Storage>(
		&mut self,
		page_no: u32,
		page_size: usize,
		file: &mut F,
	) -> Result<Option<&mut Page>> {
		if !self.map.contains(&page_no) {
			let mut buf = vec![0u8; page_size];
			if !file.read_page(page_no, &mut buf)? {
				return Ok(None);
			}
			self.insert(page_no, Page::from_bytes(buf), file)?;
		}
		Ok(self.map.get_mut(&page_no))
	}

	/// Insert a page, evicting a batch first when the cache is full.
	pub fn insert<F: Storage>(&mut self, page_no: u32, page: Page, file: &mut F) -> Result<()> {
		if self.map.len() >= self.capacity {
			self.evict_batch(file)?;
		}
		self.map.put(page_no, page);
		Ok(())
	}

	/// Fetch-or-create the node page backing `page_no`, claiming fresh or
	/// still-unallocated pages for `page_type`.
	pub fn node_page<F: Storage>(
		&mut self,
		page_no: u32,
		page_size: usize,
		page_type: u8,
		file: &mut F,
	) -> Result<&mut Page> {
		match self.get(page_no, page_size, file)? {
			Some(page) => {
				if page.page_type() == PAGE_FREE {
					page.set_page_type(page_type);
				} else if page.page_type() != page_type {
					return Err(Error::Corruption(format!(
						"page {page_no} holds type {} slots, node wants type {page_type}",
						page.page_type()
					)));
				}
			}
			None => {
				self.insert(page_no, Page::new_node_page(page_size, page_type), file)?;
			}
		}
		Ok(self.map.get_mut(&page_no).expect("page was just cached"))
	}

	fn evict_batch<F: Storage>(&mut self, file: &mut F) -> Result<()> {
		let mut batch = BTreeMap::new();
		for _ in 0..self.discard.min(self.map.len()) {
			if let Some((page_no, page)) = self.map.pop_lru() {
				if page.is_dirty() {
					batch.insert(page_no, page);
				}
			}
		}
		for (page_no, page) in batch {
			file.write_page(page_no, page.bytes())?;
		}
		Ok(())
	}

	/// Write every dirty page, in page order, without evicting anything.
	pub fn sync<F: Storage>(&mut self, file: &mut F) -> Result<()> {
		let mut dirty: Vec<_> =
			self.map.iter_mut().filter(|(_, page)| page.is_dirty()).collect();
		dirty.sort_by_key(|(page_no, _)| **page_no);
		for (page_no, page) in dirty {
			file.write_page(*page_no, page.bytes())?;
			page.clear_dirty();
		}
		Ok(())
	}

	/// Write every dirty page and drop the whole cache.
	pub fn flush_all<F: Storage>(&mut self, file: &mut F) -> Result<()> {
		self.sync(file)?;
		self.map.clear();
		Ok(())
	}

	#[cfg(test)]
	pub fn resident(&self) -> usize {
		self.map.len()
	}
}

/// Write-back cache of deserialized node objects. Eviction walks the LRU
/// tail; nodes pinned by an in-flight split chain and the current root are
/// cycled back to the MRU end instead of evicted. A full cycle that frees
/// nothing means the cache cannot hold the working set and is reported as
/// `CacheUndersized` rather than retried forever.
///
/// Evicting a dirty node serializes it into its slot in the owning page,
/// which goes through the page cache, never straight to disk.
pub(crate) struct NodeCache {
	map: LruCache<NodeAddr, NodeHandle>,
	capacity: usize,
	root: Option<NodeAddr>,
}

impl NodeCache {
	pub fn new(capacity: usize) -> NodeCache {
		NodeCache {
			map: LruCache::unbounded(),
			capacity,
			root: None,
		}
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn set_root(&mut self, root: NodeAddr) {
		self.root = Some(root);
	}

	pub fn get(&mut self, addr: NodeAddr) -> Option<NodeHandle> {
		self.map.get(&addr).cloned()
	}

	pub fn insert<F: Storage>(
		&mut self,
		addr: NodeAddr,
		node: NodeHandle,
		pages: &mut PageCache,
		file: &mut F,
		layout: &Layout,
	) -> Result<()> {
		if self.map.len() >= self.capacity {
			self.evict_batch(pages, file, layout)?;
		}
		self.map.put(addr, node);
		Ok(())
	}

	fn evict_batch<F: Storage>(
		&mut self,
		pages: &mut PageCache,
		file: &mut F,
		layout: &Layout,
	) -> Result<()> {
		let target = (self.capacity * 2 / 5).max(1);
		let mut evicted = 0;
		let mut cycled = 0;
		while evicted < target {
			let Some((addr, node)) = self.map.pop_lru() else {
				break;
			};
			let keep = node.borrow().is_pinned() || Some(addr) == self.root;
			if keep {
				self.map.put(addr, node);
				cycled += 1;
				if cycled > self.map.len() {
					if evicted == 0 {
						return Err(Error::CacheUndersized(format!(
							"all {} resident nodes are pinned or the root; capacity {} cannot \
							 hold the active mutation path",
							self.map.len(),
							self.capacity
						)));
					}
					break;
				}
				continue;
			}
			if node.borrow().is_dirty() {
				write_back(&node, pages, file, layout)?;
			}
			evicted += 1;
			cycled = 0;
		}
		Ok(())
	}

	/// Serialize every dirty node into its page without evicting.
	pub fn sync<F: Storage>(
		&mut self,
		pages: &mut PageCache,
		file: &mut F,
		layout: &Layout,
	) -> Result<()> {
		for (_, node) in self.map.iter() {
			if node.borrow().is_dirty() {
				write_back(node, pages, file, layout)?;
			}
		}
		Ok(())
	}

	/// Serialize every dirty node and drop the cache.
	pub fn flush_all<F: Storage>(
		&mut self,
		pages: &mut PageCache,
		file: &mut F,
		layout: &Layout,
	) -> Result<()> {
		self.sync(pages, file, layout)?;
		self.map.clear();
		Ok(())
	}

	#[cfg(test)]
	pub fn resident(&self) -> usize {
		self.map.len()
	}
}

/// Push one node's bytes into its slot inside the owning page and mark the
/// node clean.
fn write_back<F: Storage>(
	node: &NodeHandle,
	pages: &mut PageCache,
	file: &mut F,
	layout: &Layout,
) -> Result<()> {
	let node = node.borrow();
	let page_type = node.page_type();
	let slot_size = layout.slot_size(page_type);
	let page = pages.node_page(node.addr.page, layout.page_size, page_type, file)?;
	node.encode_into(page.slot_mut(node.addr.slot, slot_size), layout);
	node.clear_dirty();
	Ok(())
}
