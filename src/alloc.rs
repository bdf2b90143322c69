use std::fmt;

/// Address of one node slot: the page holding it and the slot index inside
/// that page. Whether the page holds internal or leaf slots is recorded in
/// the page's type byte, never in the address itself.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeAddr {
	pub page: u32,
	pub slot: u16,
}

impl NodeAddr {
	pub(crate) fn pack(self) -> u64 {
		((self.page as u64) << 16) | self.slot as u64
	}

	pub(crate) fn unpack(raw: u64) -> Self {
		NodeAddr {
			page: (raw >> 16) as u32,
			slot: (raw & 0xffff) as u16,
		}
	}

	/// `u64::MAX` stands for "no address" so `Option<NodeAddr>` survives
	/// the fixed 8-byte wire form.
	pub(crate) fn pack_opt(addr: Option<NodeAddr>) -> u64 {
		match addr {
			Some(a) => a.pack(),
			None => u64::MAX,
		}
	}

	pub(crate) fn unpack_opt(raw: u64) -> Option<NodeAddr> {
		if raw == u64::MAX {
			None
		} else {
			Some(Self::unpack(raw))
		}
	}
}

impl fmt::Display for NodeAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.page, self.slot)
	}
}

/// Address of a byte extent in the data region, packed into one u64 with
/// multipliers derived from the page size: the offset multiplier is
/// `2 * page_size` (a length can be a full page) and the page multiplier is
/// its square.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DataAddr {
	pub page: u32,
	pub offset: u32,
	pub len: u32,
}

impl DataAddr {
	pub fn pack(self, page_size: usize) -> u64 {
		let off_mult = 2 * page_size as u64;
		self.page as u64 * off_mult * off_mult + self.offset as u64 * off_mult + self.len as u64
	}

	pub fn unpack(raw: u64, page_size: usize) -> Self {
		let off_mult = 2 * page_size as u64;
		let page_mult = off_mult * off_mult;
		let within = raw % page_mult;
		DataAddr {
			page: (raw / page_mult) as u32,
			offset: (within / off_mult) as u32,
			len: (within % off_mult) as u32,
		}
	}
}

/// Per-region allocation cursors over the shared page file. Internal node
/// pages start at page 0, leaf pages at page 1 and (for trees with a data
/// region) data pages at page 2; whenever a cursor exhausts its page it
/// rolls to one past the highest page any region has claimed, so the three
/// regions interleave without collisions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotAllocator {
	internal: (u32, u16),
	leaf: (u32, u16),
	data: Option<(u32, u32)>,
	internal_per_page: u16,
	leaf_per_page: u16,
	page_size: u32,
}

impl SlotAllocator {
	pub fn new(
		internal_per_page: u16,
		leaf_per_page: u16,
		page_size: usize,
		has_data_region: bool,
	) -> Self {
		SlotAllocator {
			internal: (0, 0),
			leaf: (1, 0),
			data: has_data_region.then_some((2, 0)),
			internal_per_page,
			leaf_per_page,
			page_size: page_size as u32,
		}
	}

	fn max_page(&self) -> u32 {
		let node_max = self.internal.0.max(self.leaf.0);
		match self.data {
			Some((page, _)) => node_max.max(page),
			None => node_max,
		}
	}

	pub fn alloc_internal(&mut self) -> NodeAddr {
		let addr = NodeAddr {
			page: self.internal.0,
			slot: self.internal.1,
		};
		self.internal.1 += 1;
		if self.internal.1 >= self.internal_per_page {
			self.internal = (self.max_page() + 1, 0);
		}
		addr
	}

	pub fn alloc_leaf(&mut self) -> NodeAddr {
		let addr = NodeAddr {
			page: self.leaf.0,
			slot: self.leaf.1,
		};
		self.leaf.1 += 1;
		if self.leaf.1 >= self.leaf_per_page {
			self.leaf = (self.max_page() + 1, 0);
		}
		addr
	}

	/// Claim `len` bytes in the data region, rolling to a fresh page when
	/// the current one cannot hold the extent. `len` never exceeds one
	/// page; larger values are chunked by the tree core before they get
	/// here.
	pub fn alloc_data(&mut self, len: u32) -> DataAddr {
		debug_assert!(len <= self.page_size);
		let (mut page, mut offset) =
			self.data.expect("data allocation on a tree without a data region");
		if offset + len > self.page_size {
			page = self.max_page() + 1;
			offset = 0;
		}
		let addr = DataAddr {
			page,
			offset,
			len,
		};
		self.data = Some((page, offset + len));
		addr
	}

	// Cursor accessors for metadata persistence.

	pub(crate) fn cursors(&self) -> ((u32, u16), (u32, u16), Option<(u32, u32)>) {
		(self.internal, self.leaf, self.data)
	}

	pub(crate) fn restore(
		internal: (u32, u16),
		leaf: (u32, u16),
		data: Option<(u32, u32)>,
		internal_per_page: u16,
		leaf_per_page: u16,
		page_size: usize,
	) -> Self {
		SlotAllocator {
			internal,
			leaf,
			data,
			internal_per_page,
			leaf_per_page,
			page_size: page_size as u32,
		}
	}
}
