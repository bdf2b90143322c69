use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use crate::alloc::{NodeAddr, SlotAllocator};
use crate::cache::{NodeCache, PageCache};
use crate::error::{Error, Result};
use crate::meta::{MetaState, Metadata};
use crate::node::{is_sentinel_key, Layout, Node, NodeBody, NodeHandle};
use crate::options::Options;
use crate::page::{PAGE_INTERNAL, PAGE_LEAF};
use crate::storage::{DiskStorage, Storage};
use crate::types::{Key, KeyKind, Value, ValueKind};
use crate::values::{Inline, Spill, ValueMode};

/// Clustered tree: fixed-length values stored inline in the leaves.
pub type ClusteredTree = BPlusTree<DiskStorage, Inline>;
/// Unclustered tree: variable-length values spilled to the data region.
pub type UnclusteredTree = BPlusTree<DiskStorage, Spill>;

/// Disk-backed, single-writer B+Tree index. One generic engine covers both
/// storage strategies; the key and value types are locked in by the first
/// inserted pair.
///
/// All operations, reads included, may fault nodes and pages into the
/// write-back caches and therefore take `&mut self`. Nothing here is safe
/// to share across threads.
pub struct BPlusTree<F: Storage, M: ValueMode> {
	opts: Options,
	file: F,
	mode: M,
	pages: PageCache,
	state: Option<TreeState>,
	closed: bool,
}

/// Everything that only exists once the first insert has locked the types.
struct TreeState {
	layout: Layout,
	key_kind: KeyKind,
	value_kind: ValueKind,
	value_width: usize,
	nodes: NodeCache,
	alloc: SlotAllocator,
	root: NodeHandle,
	head: NodeAddr,
	tail: NodeAddr,
	depth: u16,
	count: u64,
}

/// First index whose key sorts strictly above `key`. Insert position for
/// new entries: equal keys accumulate in insertion order.
fn upper_bound(keys: &[Vec<u8>], key: &[u8]) -> usize {
	keys.partition_point(|k| k.as_slice() <= key)
}

/// First index whose key sorts at or above `key`: the leftmost candidate
/// for an equal-key run.
fn lower_bound(keys: &[Vec<u8>], key: &[u8]) -> usize {
	keys.partition_point(|k| k.as_slice() < key)
}

fn leaf_values(node: &Node) -> &Vec<Vec<u8>> {
	match &node.body {
		NodeBody::Leaf {
			values,
			..
		} => values,
		NodeBody::Internal {
			..
		} => unreachable!("internal nodes hold no values"),
	}
}

fn leaf_next(node: &Node) -> Option<NodeAddr> {
	match &node.body {
		NodeBody::Leaf {
			next,
			..
		} => *next,
		NodeBody::Internal {
			..
		} => unreachable!("internal nodes have no siblings"),
	}
}

fn leaf_prev(node: &Node) -> Option<NodeAddr> {
	match &node.body {
		NodeBody::Leaf {
			prev,
			..
		} => *prev,
		NodeBody::Internal {
			..
		} => unreachable!("internal nodes have no siblings"),
	}
}

fn node_cache_capacity(opts: &Options, layout: &Layout) -> usize {
	if opts.node_cache_capacity > 0 {
		opts.node_cache_capacity
	} else {
		100.max(layout.internal_cap * 3)
	}
}

/// Mutable view over the pieces every tree walk needs, split out of the
/// tree struct so the borrow of each field stays independent.
struct TreeCtx<'a, F: Storage, M: ValueMode> {
	layout: &'a Layout,
	nodes: &'a mut NodeCache,
	pages: &'a mut PageCache,
	file: &'a mut F,
	mode: &'a mut M,
	alloc: &'a mut SlotAllocator,
	root: &'a mut NodeHandle,
	tail: &'a mut NodeAddr,
	depth: &'a mut u16,
}

impl<'a, F: Storage, M: ValueMode> TreeCtx<'a, F, M> {
	/// Resolve a node address through the object cache, faulting the
	/// containing page in through the block cache on a miss.
	fn fetch(&mut self, addr: NodeAddr) -> Result<NodeHandle> {
		if let Some(handle) = self.nodes.get(addr) {
			return Ok(handle);
		}
		let (page_type, slot_bytes) = {
			let page = self
				.pages
				.get(addr.page, self.layout.page_size, self.file)?
				.ok_or_else(|| {
					Error::Corruption(format!("node {addr} points at an unwritten page"))
				})?;
			let page_type = page.page_type();
			if page_type != PAGE_INTERNAL && page_type != PAGE_LEAF {
				return Err(Error::Corruption(format!(
					"node {addr} lives on a page of type {page_type}"
				)));
			}
			let per_page = if page_type == PAGE_LEAF {
				self.layout.leaf_per_page
			} else {
				self.layout.internal_per_page
			};
			if addr.slot >= per_page {
				return Err(Error::Corruption(format!(
					"slot index {addr} exceeds the {per_page} slots of a node page"
				)));
			}
			let slot_size = self.layout.slot_size(page_type);
			(page_type, page.slot(addr.slot, slot_size).to_vec())
		};
		let node = Node::decode(&slot_bytes, page_type, self.layout)?;
		if node.addr != addr {
			return Err(Error::Corruption(format!(
				"slot at {addr} claims to be node {}",
				node.addr
			)));
		}
		let handle = Rc::new(RefCell::new(node));
		self.nodes.insert(addr, handle.clone(), self.pages, self.file, self.layout)?;
		Ok(handle)
	}

	/// Allocate a fresh node. It enters the cache pinned; the caller
	/// releases it once it is fully linked into the tree.
	fn new_node(&mut self, leaf: bool) -> Result<NodeHandle> {
		let addr = if leaf {
			self.alloc.alloc_leaf()
		} else {
			self.alloc.alloc_internal()
		};
		let node = if leaf {
			Node::new_leaf(addr)
		} else {
			Node::new_internal(addr)
		};
		node.pin();
		let handle = Rc::new(RefCell::new(node));
		self.nodes.insert(addr, handle.clone(), self.pages, self.file, self.layout)?;
		Ok(handle)
	}

	/// Resolve a node's parent. A root has none; asking for it
	/// materializes a fresh internal node, which `insert_into_parent`
	/// will promote to the new root.
	fn parent_of(&mut self, child: &NodeHandle) -> Result<NodeHandle> {
		let parent_addr = child.borrow().parent;
		match parent_addr {
			Some(addr) => self.fetch(addr),
			None => {
				let parent = self.new_node(false)?;
				let parent_addr = parent.borrow().addr;
				let mut c = child.borrow_mut();
				c.parent = Some(parent_addr);
				c.mark_dirty();
				Ok(parent)
			}
		}
	}

	/// Insert one leaf entry, splitting on overflow. Returns false when a
	/// clustered duplicate overwrote in place.
	fn insert_entry(&mut self, key: &[u8], slot: Vec<u8>) -> Result<bool> {
		let mut cur = self.root.clone();
		loop {
			let next = {
				let n = cur.borrow();
				match &n.body {
					NodeBody::Internal {
						children,
					} => Some(children[upper_bound(&n.keys, key)]),
					NodeBody::Leaf {
						..
					} => None,
				}
			};
			match next {
				Some(addr) => cur = self.fetch(addr)?,
				None => break,
			}
		}

		let inserted = {
			let mut leaf = cur.borrow_mut();
			let pos = upper_bound(&leaf.keys, key);
			if M::OVERWRITE && pos > 0 && leaf.keys[pos - 1] == key {
				match &mut leaf.body {
					NodeBody::Leaf {
						values,
						..
					} => values[pos - 1] = slot,
					NodeBody::Internal {
						..
					} => unreachable!(),
				}
				leaf.mark_dirty();
				false
			} else {
				leaf.keys.insert(pos, key.to_vec());
				match &mut leaf.body {
					NodeBody::Leaf {
						values,
						..
					} => values.insert(pos, slot),
					NodeBody::Internal {
						..
					} => unreachable!(),
				}
				leaf.mark_dirty();
				true
			}
		};
		if cur.borrow().len() > self.layout.leaf_cap {
			self.split_leaf(cur)?;
		}
		Ok(inserted)
	}

	fn split_leaf(&mut self, left: NodeHandle) -> Result<()> {
		left.borrow().pin();
		let (keys_r, values_r, left_addr, old_next) = {
			let mut n = left.borrow_mut();
			let total = n.keys.len();
			let mut mid = total / 2;
			if n.keys[0] == n.keys[total - 1] {
				// a node full of one key peels off a single entry so the
				// run stays contiguous in leaf order
				mid = total - 1;
			}
			let keys_r = n.keys.split_off(mid);
			let (values_r, old_next) = match &mut n.body {
				NodeBody::Leaf {
					values,
					next,
					..
				} => (values.split_off(mid), *next),
				NodeBody::Internal {
					..
				} => unreachable!(),
			};
			n.mark_dirty();
			(keys_r, values_r, n.addr, old_next)
		};

		let right = self.new_node(true)?;
		let right_addr = right.borrow().addr;
		let sep = keys_r[0].clone();
		{
			let mut r = right.borrow_mut();
			r.keys = keys_r;
			match &mut r.body {
				NodeBody::Leaf {
					values,
					prev,
					next,
				} => {
					*values = values_r;
					*prev = Some(left_addr);
					*next = old_next;
				}
				NodeBody::Internal {
					..
				} => unreachable!(),
			}
		}
		{
			let mut n = left.borrow_mut();
			match &mut n.body {
				NodeBody::Leaf {
					next,
					..
				} => *next = Some(right_addr),
				NodeBody::Internal {
					..
				} => unreachable!(),
			}
		}
		match old_next {
			Some(next_addr) => {
				let neighbor = self.fetch(next_addr)?;
				let mut n = neighbor.borrow_mut();
				match &mut n.body {
					NodeBody::Leaf {
						prev,
						..
					} => *prev = Some(right_addr),
					NodeBody::Internal {
						..
					} => unreachable!(),
				}
				n.mark_dirty();
			}
			None => *self.tail = right_addr,
		}

		let parent = self.parent_of(&left)?;
		self.insert_into_parent(parent, left_addr, sep, &right)?;
		left.borrow().unpin();
		right.borrow().unpin();
		Ok(())
	}

	/// Hang `right` (and its separator) off the parent, to the immediate
	/// right of the child that just split. The position comes from the
	/// child address, not a key search, so duplicate separators cannot
	/// misplace a sibling.
	fn insert_into_parent(
		&mut self,
		parent: NodeHandle,
		left_addr: NodeAddr,
		sep: Vec<u8>,
		right: &NodeHandle,
	) -> Result<()> {
		parent.borrow().pin();
		let parent_addr = parent.borrow().addr;
		let fresh_root = parent.borrow().internal_children().is_empty();
		if fresh_root {
			{
				let mut p = parent.borrow_mut();
				p.keys = vec![sep];
				*p.internal_children_mut() = vec![left_addr, right.borrow().addr];
				p.mark_dirty();
			}
			{
				let mut r = right.borrow_mut();
				r.parent = Some(parent_addr);
				r.mark_dirty();
			}
			*self.root = parent.clone();
			self.nodes.set_root(parent_addr);
			*self.depth += 1;
			parent.borrow().unpin();
			return Ok(());
		}

		{
			let mut p = parent.borrow_mut();
			let pos = p
				.internal_children()
				.iter()
				.position(|c| *c == left_addr)
				.ok_or_else(|| {
					Error::Corruption(format!(
						"split child {left_addr} missing from parent {parent_addr}"
					))
				})?;
			p.keys.insert(pos, sep);
			let right_addr = right.borrow().addr;
			p.internal_children_mut().insert(pos + 1, right_addr);
			p.mark_dirty();
		}
		{
			let mut r = right.borrow_mut();
			r.parent = Some(parent_addr);
			r.mark_dirty();
		}
		if parent.borrow().len() > self.layout.internal_cap {
			self.split_internal(parent.clone())?;
		}
		parent.borrow().unpin();
		Ok(())
	}

	/// Split an overflowing internal node, promoting (and removing) the
	/// middle key. The caller holds `left` pinned.
	fn split_internal(&mut self, left: NodeHandle) -> Result<()> {
		let (promote, keys_r, children_r, left_addr) = {
			let mut n = left.borrow_mut();
			let total = n.keys.len();
			let mut mid = total / 2;
			if n.keys[0] == n.keys[total - 1] {
				mid = total - 2;
			}
			let mut keys_r = n.keys.split_off(mid);
			let promote = keys_r.remove(0);
			let children_r = n.internal_children_mut().split_off(mid + 1);
			n.mark_dirty();
			(promote, keys_r, children_r, n.addr)
		};

		let right = self.new_node(false)?;
		let right_addr = right.borrow().addr;
		{
			let mut r = right.borrow_mut();
			r.keys = keys_r;
			*r.internal_children_mut() = children_r;
		}
		// the moved children now answer to the right node
		let child_addrs = right.borrow().internal_children().clone();
		for child_addr in child_addrs {
			let child = self.fetch(child_addr)?;
			let mut c = child.borrow_mut();
			c.parent = Some(right_addr);
			c.mark_dirty();
		}

		let parent = self.parent_of(&left)?;
		self.insert_into_parent(parent, left_addr, promote, &right)?;
		right.borrow().unpin();
		Ok(())
	}

	/// Walk to the leftmost leaf that can hold `key`, taking the left
	/// branch on equal separators.
	fn descend_lower(&mut self, key: &[u8]) -> Result<NodeHandle> {
		let mut cur = self.root.clone();
		loop {
			let next = {
				let n = cur.borrow();
				match &n.body {
					NodeBody::Internal {
						children,
					} => Some(children[lower_bound(&n.keys, key)]),
					NodeBody::Leaf {
						..
					} => None,
				}
			};
			match next {
				Some(addr) => cur = self.fetch(addr)?,
				None => return Ok(cur),
			}
		}
	}

	/// Gather the value slots of the equal-key run starting at
	/// `(node, idx)`, following `next` links while the run continues.
	/// Returns the slots plus the position right after the run, if any.
	fn collect_run_forward(
		&mut self,
		mut node: NodeHandle,
		mut idx: usize,
		key: &[u8],
	) -> Result<(Vec<Vec<u8>>, Option<(NodeHandle, usize)>)> {
		let mut slots = Vec::new();
		loop {
			let (next, len) = {
				let n = node.borrow();
				let values = leaf_values(&n);
				while idx < n.keys.len() && n.keys[idx].as_slice() == key {
					slots.push(values[idx].clone());
					idx += 1;
				}
				(leaf_next(&n), n.keys.len())
			};
			if idx < len {
				return Ok((slots, Some((node, idx))));
			}
			match next {
				Some(addr) => {
					node = self.fetch(addr)?;
					idx = 0;
					let continues = {
						let n = node.borrow();
						!n.keys.is_empty() && n.keys[0].as_slice() == key
					};
					if !continues {
						return Ok((slots, Some((node, 0))));
					}
				}
				None => return Ok((slots, None)),
			}
		}
	}

	/// Mirror image of `collect_run_forward`, walking `prev` links. Slots
	/// come out in reverse leaf order.
	fn collect_run_backward(
		&mut self,
		mut node: NodeHandle,
		mut idx: usize,
		key: &[u8],
	) -> Result<(Vec<Vec<u8>>, Option<(NodeHandle, usize)>)> {
		let mut slots = Vec::new();
		loop {
			let (prev, exhausted) = {
				let n = node.borrow();
				let values = leaf_values(&n);
				let mut exhausted = false;
				loop {
					if n.keys[idx].as_slice() != key {
						break;
					}
					slots.push(values[idx].clone());
					if idx == 0 {
						exhausted = true;
						break;
					}
					idx -= 1;
				}
				(leaf_prev(&n), exhausted)
			};
			if !exhausted {
				return Ok((slots, Some((node, idx))));
			}
			match prev {
				Some(addr) => {
					node = self.fetch(addr)?;
					let (last, continues) = {
						let n = node.borrow();
						let last = n.keys.len() - 1;
						(last, n.keys[last].as_slice() == key)
					};
					idx = last;
					if !continues {
						return Ok((slots, Some((node, idx))));
					}
				}
				None => return Ok((slots, None)),
			}
		}
	}

	/// Resolve and concatenate a run's slots into the logical value bytes.
	fn resolve_slots(&mut self, slots: &[Vec<u8>]) -> Result<Vec<u8>> {
		let mut bytes = Vec::new();
		for slot in slots {
			bytes.extend_from_slice(&self.mode.load(slot, self.file)?);
		}
		Ok(bytes)
	}
}

impl<F: Storage, M: ValueMode> BPlusTree<F, M> {
	/// Build a fresh tree over the given storage. Types are locked in by
	/// the first insert.
	pub fn with_storage(file: F, opts: Options) -> Result<Self> {
		opts.validate()?;
		Ok(BPlusTree {
			mode: M::new(&opts),
			pages: PageCache::new(opts.page_cache_capacity, opts.cache_factor),
			file,
			opts,
			state: None,
			closed: false,
		})
	}

	/// Reopen a tree from the metadata its last `close()` wrote.
	pub fn from_storage(file: F) -> Result<Self> {
		Self::from_storage_inner(file, None)
	}

	fn from_storage_inner(file: F, cache_override: Option<(usize, usize)>) -> Result<Self> {
		let bytes = file.read_meta()?.ok_or_else(|| {
			Error::CorruptMetadata("no metadata side-file; the tree was never closed".into())
		})?;
		let meta = Metadata::decode(&bytes)?;
		if meta.mode_tag != M::TAG {
			return Err(Error::CorruptMetadata(format!(
				"tree was created with storage strategy {}, opened as strategy {}",
				meta.mode_tag,
				M::TAG
			)));
		}
		let mut opts = meta.options;
		if let Some((page_cache, data_cache)) = cache_override {
			opts.page_cache_capacity = page_cache;
			opts.data_cache_capacity = data_cache;
		}
		opts.validate()?;

		let mut tree = BPlusTree {
			mode: M::new(&opts),
			pages: PageCache::new(opts.page_cache_capacity, opts.cache_factor),
			file,
			opts,
			state: None,
			closed: false,
		};
		let Some(ms) = meta.state else {
			return Ok(tree);
		};

		let layout = Layout::new(
			tree.opts.page_size,
			tree.opts.nodes_per_page,
			ms.key_kind.width(),
			M::slot_width(ms.value_width as usize),
		)?;
		if ms.root_bytes.len() != layout.slot_size(ms.root_page_type) {
			return Err(Error::CorruptMetadata(
				"saved root node does not match the tree layout".into(),
			));
		}
		if ms.data_cursor.is_some() != M::HAS_DATA_REGION {
			return Err(Error::CorruptMetadata(
				"data region cursor does not match the storage strategy".into(),
			));
		}
		let root_node = Node::decode(&ms.root_bytes, ms.root_page_type, &layout)
			.map_err(|e| Error::CorruptMetadata(format!("saved root node: {e}")))?;
		if root_node.addr != ms.root {
			return Err(Error::CorruptMetadata("saved root node address mismatch".into()));
		}

		let mut nodes = NodeCache::new(node_cache_capacity(&tree.opts, &layout));
		nodes.set_root(ms.root);
		let root = Rc::new(RefCell::new(root_node));
		nodes.insert(ms.root, root.clone(), &mut tree.pages, &mut tree.file, &layout)?;
		let alloc = SlotAllocator::restore(
			ms.internal_cursor,
			ms.leaf_cursor,
			ms.data_cursor,
			layout.internal_per_page,
			layout.leaf_per_page,
			tree.opts.page_size,
		);
		tree.state = Some(TreeState {
			layout,
			key_kind: ms.key_kind,
			value_kind: ms.value_kind,
			value_width: ms.value_width as usize,
			nodes,
			alloc,
			root,
			head: ms.head,
			tail: ms.tail,
			depth: ms.depth,
			count: ms.entry_count,
		});
		Ok(tree)
	}

	fn ctx(&mut self) -> TreeCtx<'_, F, M> {
		let state = self.state.as_mut().expect("tree state is initialized");
		let TreeState {
			layout,
			nodes,
			alloc,
			root,
			tail,
			depth,
			..
		} = state;
		TreeCtx {
			layout,
			nodes,
			pages: &mut self.pages,
			file: &mut self.file,
			mode: &mut self.mode,
			alloc,
			root,
			tail,
			depth,
		}
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed {
			return Err(Error::InvalidArgument("tree is closed".into()));
		}
		Ok(())
	}

	fn init_state(&mut self, key: &Key, value: &Value, encoded_value: &[u8]) -> Result<()> {
		let key_kind = key.kind();
		let value_kind = value.kind();
		M::check_key_kind(key_kind)?;
		M::check_value_kind(value_kind)?;
		let value_width = encoded_value.len();
		if M::OVERWRITE && value_width == 0 {
			return Err(Error::UnsupportedType(
				"a zero-length value cannot lock a clustered leaf layout".into(),
			));
		}
		let layout = Layout::new(
			self.opts.page_size,
			self.opts.nodes_per_page,
			key_kind.width(),
			M::slot_width(value_width),
		)?;
		let mut nodes = NodeCache::new(node_cache_capacity(&self.opts, &layout));
		let mut alloc = SlotAllocator::new(
			layout.internal_per_page,
			layout.leaf_per_page,
			self.opts.page_size,
			M::HAS_DATA_REGION,
		);
		let root_addr = alloc.alloc_leaf();
		let root = Rc::new(RefCell::new(Node::new_leaf(root_addr)));
		nodes.set_root(root_addr);
		nodes.insert(root_addr, root.clone(), &mut self.pages, &mut self.file, &layout)?;
		self.state = Some(TreeState {
			layout,
			key_kind,
			value_kind,
			value_width,
			nodes,
			alloc,
			root,
			head: root_addr,
			tail: root_addr,
			depth: 1,
			count: 0,
		});
		Ok(())
	}

	/// Insert one key/value pair. Clustered trees overwrite an existing
	/// key in place; unclustered trees accumulate equal keys, and values
	/// longer than a page are chunked into one leaf entry per page.
	pub fn insert(&mut self, key: &Key, value: &Value) -> Result<()> {
		self.ensure_open()?;
		let encoded_key = key.encode();
		if encoded_key.is_empty() {
			return Err(Error::NullKey);
		}
		if is_sentinel_key(&encoded_key) {
			return Err(Error::UnsupportedType(
				"key encoding collides with the slot padding sentinel".into(),
			));
		}
		let encoded_value = value.encode();
		if self.state.is_none() {
			self.init_state(key, value, &encoded_value)?;
		}
		{
			let state = self.state.as_ref().expect("state initialized above");
			if key.kind() != state.key_kind {
				return Err(Error::TypeMismatch(format!(
					"tree indexes {:?} keys, got {:?}",
					state.key_kind,
					key.kind()
				)));
			}
			if value.kind() != state.value_kind {
				return Err(Error::TypeMismatch(format!(
					"tree stores {:?} values, got {:?}",
					state.value_kind,
					value.kind()
				)));
			}
			if M::OVERWRITE && encoded_value.len() != state.value_width {
				return Err(Error::TypeMismatch(format!(
					"clustered values are {} bytes, got {}",
					state.value_width,
					encoded_value.len()
				)));
			}
			// a split chain pins two nodes per level plus the grown root;
			// refuse up front rather than livelock in eviction
			let required = 2 * (state.depth as usize + 1) + 2;
			if state.nodes.capacity() < required {
				return Err(Error::CacheUndersized(format!(
					"capacity {} cannot pin a split chain at height {} (needs {required})",
					state.nodes.capacity(),
					state.depth
				)));
			}
		}

		let mut ctx = self.ctx();
		let mut inserted = false;
		match M::max_chunk(ctx.layout.page_size) {
			None => {
				let slot = ctx.mode.store(&encoded_value, ctx.alloc, ctx.file)?;
				inserted = ctx.insert_entry(&encoded_key, slot)?;
			}
			Some(limit) => {
				if encoded_value.is_empty() {
					let slot = ctx.mode.store(&[], ctx.alloc, ctx.file)?;
					inserted |= ctx.insert_entry(&encoded_key, slot)?;
				} else {
					for chunk in encoded_value.chunks(limit) {
						let slot = ctx.mode.store(chunk, ctx.alloc, ctx.file)?;
						inserted |= ctx.insert_entry(&encoded_key, slot)?;
					}
				}
			}
		}
		if inserted {
			self.state.as_mut().expect("state initialized").count += 1;
		}
		Ok(())
	}

	/// Look one key up. Unclustered trees concatenate every consecutive
	/// equal-key entry (duplicates and chunks alike) into one result.
	pub fn find(&mut self, key: &Key) -> Result<Option<Value>> {
		self.ensure_open()?;
		let (key_kind, value_kind) = match &self.state {
			None => return Ok(None),
			Some(state) => (state.key_kind, state.value_kind),
		};
		if key.kind() != key_kind {
			return Err(Error::TypeMismatch(format!(
				"tree indexes {key_kind:?} keys, got {:?}",
				key.kind()
			)));
		}
		let encoded = key.encode();
		if encoded.is_empty() {
			return Err(Error::NullKey);
		}

		let mut ctx = self.ctx();
		let mut node = ctx.descend_lower(&encoded)?;
		let mut idx = lower_bound(&node.borrow().keys, &encoded);
		// the run may start in the next leaf when every key here is smaller
		loop {
			let (len, next) = {
				let n = node.borrow();
				(n.keys.len(), leaf_next(&n))
			};
			if idx < len {
				break;
			}
			match next {
				Some(addr) => {
					node = ctx.fetch(addr)?;
					idx = 0;
				}
				None => return Ok(None),
			}
		}
		if node.borrow().keys[idx].as_slice() != encoded.as_slice() {
			return Ok(None);
		}
		let (slots, _) = ctx.collect_run_forward(node, idx, &encoded)?;
		let bytes = ctx.resolve_slots(&slots)?;
		Ok(Some(value_kind.decode(&bytes)?))
	}

	/// Forward cursor over the whole tree, one entry per distinct key.
	pub fn iter(&mut self) -> Result<Iter<'_, F, M>> {
		self.ensure_open()?;
		let head = self.state.as_ref().map(|s| s.head);
		let cursor = match head {
			None => None,
			Some(head) => {
				let mut ctx = self.ctx();
				let node = ctx.fetch(head)?;
				let occupied = node.borrow().len() > 0;
				occupied.then_some((node, 0))
			}
		};
		Ok(Iter {
			tree: self,
			cursor,
		})
	}

	/// Reverse cursor: exact mirror of `iter()`.
	pub fn reverse_iter(&mut self) -> Result<ReverseIter<'_, F, M>> {
		self.ensure_open()?;
		let tail = self.state.as_ref().map(|s| s.tail);
		let cursor = match tail {
			None => None,
			Some(tail) => {
				let mut ctx = self.ctx();
				let node = ctx.fetch(tail)?;
				let len = node.borrow().len();
				(len > 0).then(|| (node, len - 1))
			}
		};
		Ok(ReverseIter {
			tree: self,
			cursor,
		})
	}

	/// Count nodes on the leftmost root-to-leaf path. 0 for an empty tree.
	pub fn height(&mut self) -> Result<usize> {
		self.ensure_open()?;
		if self.state.is_none() {
			return Ok(0);
		}
		let mut ctx = self.ctx();
		let mut height = 1;
		let mut cur = ctx.root.clone();
		loop {
			let next = {
				let n = cur.borrow();
				match &n.body {
					NodeBody::Internal {
						children,
					} => Some(children[0]),
					NodeBody::Leaf {
						..
					} => None,
				}
			};
			match next {
				Some(addr) => {
					height += 1;
					cur = ctx.fetch(addr)?;
				}
				None => return Ok(height),
			}
		}
	}

	/// Number of logical entries (a clustered overwrite does not count
	/// twice).
	pub fn len(&self) -> u64 {
		self.state.as_ref().map(|s| s.count).unwrap_or(0)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Keys per internal node, once the first insert has fixed the layout.
	pub fn branching(&self) -> Option<usize> {
		self.state.as_ref().map(|s| s.layout.internal_cap)
	}

	pub fn page_size(&self) -> usize {
		self.opts.page_size
	}

	/// Push every dirty node and page down to the file without evicting
	/// anything.
	pub fn sync(&mut self) -> Result<()> {
		self.ensure_open()?;
		if let Some(state) = &mut self.state {
			let TreeState {
				layout,
				nodes,
				..
			} = state;
			nodes.sync(&mut self.pages, &mut self.file, layout)?;
		}
		self.pages.sync(&mut self.file)?;
		self.mode.sync(&mut self.file)?;
		self.file.sync()
	}

	/// Flush all caches, persist the tree shape and the serialized root in
	/// the metadata side-channel and mark the tree closed. Idempotent.
	pub fn close(&mut self) -> Result<()> {
		if self.closed {
			return Ok(());
		}
		let meta_state = match &mut self.state {
			None => None,
			Some(state) => {
				let TreeState {
					layout,
					nodes,
					alloc,
					root,
					head,
					tail,
					depth,
					count,
					key_kind,
					value_kind,
					value_width,
				} = state;
				nodes.flush_all(&mut self.pages, &mut self.file, layout)?;
				self.pages.flush_all(&mut self.file)?;
				self.mode.flush(&mut self.file)?;

				let (root_page_type, root_bytes, root_addr) = {
					let r = root.borrow();
					let mut buf = vec![0u8; layout.slot_size(r.page_type())];
					r.encode_into(&mut buf, layout);
					(r.page_type(), buf, r.addr)
				};
				let (internal_cursor, leaf_cursor, data_cursor) = alloc.cursors();
				Some(MetaState {
					key_kind: *key_kind,
					value_kind: *value_kind,
					value_width: *value_width as u16,
					depth: *depth,
					entry_count: *count,
					head: *head,
					tail: *tail,
					root: root_addr,
					root_page_type,
					root_bytes,
					internal_cursor,
					leaf_cursor,
					data_cursor,
				})
			}
		};
		let meta = Metadata {
			mode_tag: M::TAG,
			options: self.opts.clone(),
			state: meta_state,
		};
		self.file.write_meta(&meta.encode())?;
		self.file.sync()?;
		self.closed = true;
		Ok(())
	}
}

impl<M: ValueMode> BPlusTree<DiskStorage, M> {
	/// Create a fresh tree at `path`, truncating any previous one.
	pub fn create<P: AsRef<Path>>(path: P, opts: Options) -> Result<Self> {
		opts.validate()?;
		Self::with_storage(DiskStorage::create(path)?, opts)
	}

	/// Reopen a tree previously closed at `path`.
	pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
		Self::from_storage(DiskStorage::open(path)?)
	}

	/// Reopen with different block/data cache capacities than the tree was
	/// created with.
	pub fn open_with<P: AsRef<Path>>(
		path: P,
		page_cache_capacity: usize,
		data_cache_capacity: usize,
	) -> Result<Self> {
		Self::from_storage_inner(
			DiskStorage::open(path)?,
			Some((page_cache_capacity, data_cache_capacity)),
		)
	}
}

impl<F: Storage, M: ValueMode> Drop for BPlusTree<F, M> {
	fn drop(&mut self) {
		if !self.closed {
			if let Err(e) = self.close() {
				log::error!("Error closing tree during drop: {}", e);
			}
		}
	}
}

/// Forward iterator. Groups a full equal-key run (duplicates or chunks)
/// into one yielded entry.
pub struct Iter<'a, F: Storage, M: ValueMode> {
	tree: &'a mut BPlusTree<F, M>,
	cursor: Option<(NodeHandle, usize)>,
}

type Resume = Option<(NodeHandle, usize)>;

fn iter_step<F: Storage, M: ValueMode>(
	tree: &mut BPlusTree<F, M>,
	node: NodeHandle,
	idx: usize,
	forward: bool,
) -> Result<((Key, Value), Resume)> {
	let state = tree.state.as_ref().expect("a cursor implies an initialized tree");
	let (key_kind, value_kind) = (state.key_kind, state.value_kind);
	let encoded = node.borrow().keys[idx].clone();
	let mut ctx = tree.ctx();
	let (slots, resume) = if forward {
		ctx.collect_run_forward(node, idx, &encoded)?
	} else {
		// slots come back tail-first; concatenate in leaf order
		let (mut slots, resume) = ctx.collect_run_backward(node, idx, &encoded)?;
		slots.reverse();
		(slots, resume)
	};
	let bytes = ctx.resolve_slots(&slots)?;
	Ok(((key_kind.decode(&encoded)?, value_kind.decode(&bytes)?), resume))
}

impl<'a, F: Storage, M: ValueMode> Iterator for Iter<'a, F, M> {
	type Item = Result<(Key, Value)>;

	fn next(&mut self) -> Option<Self::Item> {
		let (node, idx) = self.cursor.take()?;
		match iter_step(self.tree, node, idx, true) {
			Ok((entry, resume)) => {
				self.cursor = resume;
				Some(Ok(entry))
			}
			Err(e) => Some(Err(e)),
		}
	}
}

/// Reverse iterator; yields entries in exactly the opposite order of
/// `Iter`, with the same equal-key grouping.
pub struct ReverseIter<'a, F: Storage, M: ValueMode> {
	tree: &'a mut BPlusTree<F, M>,
	cursor: Option<(NodeHandle, usize)>,
}

impl<'a, F: Storage, M: ValueMode> Iterator for ReverseIter<'a, F, M> {
	type Item = Result<(Key, Value)>;

	fn next(&mut self) -> Option<Self::Item> {
		let (node, idx) = self.cursor.take()?;
		match iter_step(self.tree, node, idx, false) {
			Ok((entry, resume)) => {
				self.cursor = resume;
				Some(Ok(entry))
			}
			Err(e) => Some(Err(e)),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use rand::rngs::StdRng;
	use rand::{Rng, SeedableRng};
	use test_log::test;

	use super::*;

	fn small_opts() -> Options {
		Options {
			page_size: 256,
			nodes_per_page: 2,
			node_cache_capacity: 0,
			page_cache_capacity: 16,
			data_cache_capacity: 16,
			cache_factor: 0.6,
		}
	}

	fn unclustered(dir: &tempfile::TempDir) -> UnclusteredTree {
		UnclusteredTree::create(dir.path().join("tree.db"), small_opts()).unwrap()
	}

	fn clustered(dir: &tempfile::TempDir) -> ClusteredTree {
		ClusteredTree::create(dir.path().join("tree.db"), small_opts()).unwrap()
	}

	#[test]
	fn empty_tree_behaves() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = unclustered(&dir);
		assert_eq!(tree.height().unwrap(), 0);
		assert_eq!(tree.len(), 0);
		assert_eq!(tree.find(&Key::Int32(1)).unwrap(), None);
		assert_eq!(tree.iter().unwrap().count(), 0);
		assert_eq!(tree.reverse_iter().unwrap().count(), 0);
		tree.close().unwrap();
	}

	#[test]
	fn fifty_keys_iterate_in_order() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = unclustered(&dir);
		// insert out of order on purpose
		for i in (1..=50).rev() {
			tree.insert(&Key::Int32(i), &Value::Str(format!("v{i}"))).unwrap();
		}
		assert_eq!(tree.len(), 50);
		assert!(tree.height().unwrap() > 1);

		let entries: Vec<_> = tree.iter().unwrap().map(|e| e.unwrap()).collect();
		assert_eq!(entries.len(), 50);
		for (i, (key, value)) in entries.iter().enumerate() {
			assert_eq!(*key, Key::Int32(i as i32 + 1));
			assert_eq!(*value, Value::Str(format!("v{}", i + 1)));
		}

		let reversed: Vec<_> = tree.reverse_iter().unwrap().map(|e| e.unwrap()).collect();
		let mut forward = entries;
		forward.reverse();
		assert_eq!(reversed, forward);
		tree.close().unwrap();
	}

	#[test]
	fn duplicate_keys_concatenate() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = unclustered(&dir);
		tree.insert(&Key::Int32(5), &Value::Str("ab".into())).unwrap();
		tree.insert(&Key::Int32(5), &Value::Str("cd".into())).unwrap();
		assert_eq!(tree.find(&Key::Int32(5)).unwrap(), Some(Value::Str("abcd".into())));

		// the iterator groups the run into one logical entry
		let entries: Vec<_> = tree.iter().unwrap().map(|e| e.unwrap()).collect();
		assert_eq!(entries, vec![(Key::Int32(5), Value::Str("abcd".into()))]);
		tree.close().unwrap();
	}

	#[test]
	fn value_three_pages_long_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = unclustered(&dir);
		let payload: Vec<u8> = (0..3 * 256).map(|i| (i % 251) as u8).collect();
		tree.insert(&Key::Int32(42), &Value::Bytes(payload.clone())).unwrap();
		assert_eq!(tree.find(&Key::Int32(42)).unwrap(), Some(Value::Bytes(payload)));
		assert_eq!(tree.len(), 1);
		tree.close().unwrap();
	}

	#[test]
	fn chunk_runs_survive_leaf_splits() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = unclustered(&dir);
		// enough page-sized chunks to force splits inside the equal-key run
		let payload: Vec<u8> = (0..20 * 256).map(|i| (i % 241) as u8).collect();
		tree.insert(&Key::Int32(3), &Value::Bytes(payload.clone())).unwrap();
		tree.insert(&Key::Int32(1), &Value::Bytes(b"before".to_vec())).unwrap();
		tree.insert(&Key::Int32(9), &Value::Bytes(b"after".to_vec())).unwrap();
		assert_eq!(tree.find(&Key::Int32(3)).unwrap(), Some(Value::Bytes(payload.clone())));

		let entries: Vec<_> = tree.iter().unwrap().map(|e| e.unwrap()).collect();
		assert_eq!(entries.len(), 3);
		assert_eq!(entries[1], (Key::Int32(3), Value::Bytes(payload.clone())));
		let reversed: Vec<_> = tree.reverse_iter().unwrap().map(|e| e.unwrap()).collect();
		assert_eq!(reversed[1], (Key::Int32(3), Value::Bytes(payload)));
		tree.close().unwrap();
	}

	#[test]
	fn clustered_overwrites_in_place() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = clustered(&dir);
		tree.insert(&Key::Int32(7), &Value::Int32(100)).unwrap();
		tree.insert(&Key::Int32(7), &Value::Int32(200)).unwrap();
		assert_eq!(tree.find(&Key::Int32(7)).unwrap(), Some(Value::Int32(200)));
		assert_eq!(tree.len(), 1);
		tree.close().unwrap();
	}

	#[test]
	fn clustered_bulk_insert_and_height() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = clustered(&dir);
		let mut last_height = 0;
		for i in 0..500 {
			tree.insert(&Key::Int32(i), &Value::Int32(i * 2)).unwrap();
			let h = tree.height().unwrap();
			assert!(h >= last_height && h <= last_height + 1);
			last_height = h;
		}
		assert!(last_height >= 3);
		for i in 0..500 {
			assert_eq!(tree.find(&Key::Int32(i)).unwrap(), Some(Value::Int32(i * 2)));
		}
		assert_eq!(tree.find(&Key::Int32(500)).unwrap(), None);
		assert_eq!(tree.find(&Key::Int32(-1)).unwrap(), None);
		tree.close().unwrap();
	}

	#[test]
	fn random_clustered_matches_reference() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = clustered(&dir);
		let mut reference = BTreeMap::new();
		let mut rng = StdRng::seed_from_u64(42);
		for _ in 0..800 {
			let key = rng.gen_range(-10_000..10_000);
			let value = rng.gen_range(0..1_000_000);
			tree.insert(&Key::Int64(key), &Value::Int64(value)).unwrap();
			reference.insert(key, value);
		}
		assert_eq!(tree.len(), reference.len() as u64);
		for (key, value) in &reference {
			assert_eq!(tree.find(&Key::Int64(*key)).unwrap(), Some(Value::Int64(*value)));
		}
		let keys: Vec<_> = tree
			.iter()
			.unwrap()
			.map(|e| match e.unwrap().0 {
				Key::Int64(k) => k,
				_ => unreachable!(),
			})
			.collect();
		let expected: Vec<_> = reference.keys().copied().collect();
		assert_eq!(keys, expected);
		tree.close().unwrap();
	}

	#[test]
	fn thousand_keys_survive_close_and_open() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("tree.db");
		{
			let mut tree = UnclusteredTree::create(&path, small_opts()).unwrap();
			for i in 0..1000 {
				tree.insert(&Key::Int32(i), &Value::Str(format!("value{i}"))).unwrap();
			}
			tree.close().unwrap();
		}
		let mut tree = UnclusteredTree::open(&path).unwrap();
		assert_eq!(tree.len(), 1000);
		for i in 0..1000 {
			assert_eq!(
				tree.find(&Key::Int32(i)).unwrap(),
				Some(Value::Str(format!("value{i}"))),
				"key {i} after reopen"
			);
		}
		let entries: Vec<_> = tree.iter().unwrap().map(|e| e.unwrap()).collect();
		assert_eq!(entries.len(), 1000);
		tree.close().unwrap();
	}

	#[test]
	fn reopened_tree_keeps_allocating_safely() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("tree.db");
		{
			let mut tree = UnclusteredTree::create(&path, small_opts()).unwrap();
			for i in 0..100 {
				tree.insert(&Key::Int32(i), &Value::Str(format!("a{i}"))).unwrap();
			}
			tree.close().unwrap();
		}
		{
			let mut tree = UnclusteredTree::open(&path).unwrap();
			for i in 100..200 {
				tree.insert(&Key::Int32(i), &Value::Str(format!("a{i}"))).unwrap();
			}
			tree.close().unwrap();
		}
		let mut tree = UnclusteredTree::open(&path).unwrap();
		assert_eq!(tree.len(), 200);
		for i in 0..200 {
			assert_eq!(tree.find(&Key::Int32(i)).unwrap(), Some(Value::Str(format!("a{i}"))));
		}
		tree.close().unwrap();
	}

	#[test]
	fn empty_tree_round_trips_through_close() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("tree.db");
		{
			let mut tree = ClusteredTree::create(&path, small_opts()).unwrap();
			tree.close().unwrap();
		}
		let mut tree = ClusteredTree::open(&path).unwrap();
		assert_eq!(tree.len(), 0);
		assert_eq!(tree.find(&Key::Int32(1)).unwrap(), None);
		tree.close().unwrap();
	}

	#[test]
	fn clustered_reopens_with_metadata() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("tree.db");
		{
			let mut tree = ClusteredTree::create(&path, small_opts()).unwrap();
			for i in 0..300 {
				tree.insert(&Key::Int32(i), &Value::Int32(i + 1)).unwrap();
			}
			tree.close().unwrap();
		}
		let mut tree = ClusteredTree::open_with(&path, 8, 8).unwrap();
		for i in 0..300 {
			assert_eq!(tree.find(&Key::Int32(i)).unwrap(), Some(Value::Int32(i + 1)));
		}
		tree.close().unwrap();
	}

	#[test]
	fn opening_the_wrong_variant_fails() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("tree.db");
		{
			let mut tree = ClusteredTree::create(&path, small_opts()).unwrap();
			tree.insert(&Key::Int32(1), &Value::Int32(1)).unwrap();
			tree.close().unwrap();
		}
		assert!(matches!(UnclusteredTree::open(&path), Err(Error::CorruptMetadata(_))));
	}

	#[test]
	fn corrupt_metadata_is_reported() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("tree.db");
		{
			let mut tree = ClusteredTree::create(&path, small_opts()).unwrap();
			tree.insert(&Key::Int32(1), &Value::Int32(1)).unwrap();
			tree.close().unwrap();
		}
		let meta_path = dir.path().join("tree.db.meta");
		let mut bytes = std::fs::read(&meta_path).unwrap();
		let at = bytes.len() / 2;
		bytes[at] ^= 0xff;
		std::fs::write(&meta_path, &bytes).unwrap();
		assert!(matches!(ClusteredTree::open(&path), Err(Error::CorruptMetadata(_))));
	}

	#[test]
	fn null_and_sentinel_keys_are_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = unclustered(&dir);
		let err = tree.insert(&Key::Bytes(vec![]), &Value::Str("x".into())).unwrap_err();
		assert!(matches!(err, Error::NullKey));
		// i32::MAX flips to all ones, the slot padding sentinel
		let err = tree.insert(&Key::Int32(i32::MAX), &Value::Str("x".into())).unwrap_err();
		assert!(matches!(err, Error::UnsupportedType(_)));
		tree.close().unwrap();
	}

	#[test]
	fn locked_types_are_enforced() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = unclustered(&dir);
		tree.insert(&Key::Int32(1), &Value::Str("one".into())).unwrap();

		let err = tree.insert(&Key::Int64(2), &Value::Str("two".into())).unwrap_err();
		assert!(matches!(err, Error::TypeMismatch(_)));
		let err = tree.insert(&Key::Int32(2), &Value::Bytes(vec![1])).unwrap_err();
		assert!(matches!(err, Error::TypeMismatch(_)));
		let err = tree.find(&Key::Int64(1)).unwrap_err();
		assert!(matches!(err, Error::TypeMismatch(_)));

		// fixed-width byte keys lock their width too
		let dir2 = tempfile::tempdir().unwrap();
		let mut tree2 = unclustered(&dir2);
		tree2.insert(&Key::Bytes(vec![1, 2, 3, 4]), &Value::Str("x".into())).unwrap();
		let err = tree2.insert(&Key::Bytes(vec![1, 2]), &Value::Str("y".into())).unwrap_err();
		assert!(matches!(err, Error::TypeMismatch(_)));
		tree.close().unwrap();
		tree2.close().unwrap();
	}

	#[test]
	fn unsupported_kinds_fail_at_first_insert() {
		let dir = tempfile::tempdir().unwrap();
		// clustered trees need fixed-length values
		let mut tree = clustered(&dir);
		let err = tree.insert(&Key::Int32(1), &Value::Str("variable".into())).unwrap_err();
		assert!(matches!(err, Error::UnsupportedType(_)));
		drop(tree);

		// unclustered trees refuse float values and float keys
		let dir2 = tempfile::tempdir().unwrap();
		let mut tree = unclustered(&dir2);
		let err = tree.insert(&Key::Int32(1), &Value::Float64(1.5)).unwrap_err();
		assert!(matches!(err, Error::UnsupportedType(_)));
		let err = tree.insert(&Key::Float64(1.5), &Value::Str("x".into())).unwrap_err();
		assert!(matches!(err, Error::UnsupportedType(_)));
		tree.close().unwrap();
	}

	#[test]
	fn clustered_value_width_is_locked() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = clustered(&dir);
		tree.insert(&Key::Int32(1), &Value::Bytes(vec![1, 2, 3, 4])).unwrap();
		let err = tree.insert(&Key::Int32(2), &Value::Bytes(vec![5])).unwrap_err();
		assert!(matches!(err, Error::TypeMismatch(_)));
		tree.close().unwrap();
	}

	#[test]
	fn float_keys_work_in_the_clustered_tree() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = clustered(&dir);
		for v in [-2.5f64, 0.0, 1.25, 100.0, -77.0] {
			tree.insert(&Key::Float64(v), &Value::Float64(v * 2.0)).unwrap();
		}
		assert_eq!(tree.find(&Key::Float64(-77.0)).unwrap(), Some(Value::Float64(-154.0)));
		let keys: Vec<_> = tree
			.iter()
			.unwrap()
			.map(|e| match e.unwrap().0 {
				Key::Float64(k) => k,
				_ => unreachable!(),
			})
			.collect();
		assert_eq!(keys, vec![-77.0, -2.5, 0.0, 1.25, 100.0]);
		tree.close().unwrap();
	}

	#[test]
	fn undersized_node_cache_is_an_error_not_a_hang() {
		let dir = tempfile::tempdir().unwrap();
		let opts = Options {
			node_cache_capacity: 5,
			..small_opts()
		};
		let mut tree =
			ClusteredTree::create(dir.path().join("tree.db"), opts).unwrap();
		// a height-1 mutation already needs more headroom than 5 nodes
		let err = tree.insert(&Key::Int32(1), &Value::Int32(1)).unwrap_err();
		assert!(matches!(err, Error::CacheUndersized(_)));
	}

	#[test]
	fn barely_sized_cache_fails_once_the_tree_grows() {
		let dir = tempfile::tempdir().unwrap();
		let opts = Options {
			node_cache_capacity: 6,
			..small_opts()
		};
		let mut tree =
			ClusteredTree::create(dir.path().join("tree.db"), opts).unwrap();
		let mut failed = None;
		for i in 0..500 {
			if let Err(e) = tree.insert(&Key::Int32(i), &Value::Int32(i)) {
				failed = Some(e);
				break;
			}
		}
		assert!(matches!(failed, Some(Error::CacheUndersized(_))));
	}

	#[test]
	fn sync_persists_without_closing() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = unclustered(&dir);
		for i in 0..200 {
			tree.insert(&Key::Int32(i), &Value::Str(format!("s{i}"))).unwrap();
		}
		tree.sync().unwrap();
		// the tree keeps working after a sync
		for i in 200..250 {
			tree.insert(&Key::Int32(i), &Value::Str(format!("s{i}"))).unwrap();
		}
		for i in 0..250 {
			assert_eq!(tree.find(&Key::Int32(i)).unwrap(), Some(Value::Str(format!("s{i}"))));
		}
		tree.close().unwrap();
	}

	#[test]
	fn operations_after_close_are_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = clustered(&dir);
		tree.insert(&Key::Int32(1), &Value::Int32(1)).unwrap();
		tree.close().unwrap();
		assert!(tree.insert(&Key::Int32(2), &Value::Int32(2)).is_err());
		assert!(tree.find(&Key::Int32(1)).is_err());
		// close is idempotent
		tree.close().unwrap();
	}

	/// Walk the whole tree through the internal handles and check its shape:
	/// sorted keys, `children == keys + 1`, all leaves at equal depth, and
	/// a sorted, acyclic sibling chain.
	fn assert_invariants<F: Storage, M: ValueMode>(tree: &mut BPlusTree<F, M>) {
		if tree.state.is_none() {
			return;
		}
		let head = tree.state.as_ref().unwrap().head;
		let mut ctx = tree.ctx();
		let root = ctx.root.clone();
		let mut leaf_depths = Vec::new();

		fn walk<F: Storage, M: ValueMode>(
			ctx: &mut TreeCtx<'_, F, M>,
			node: NodeHandle,
			depth: usize,
			leaf_depths: &mut Vec<usize>,
		) {
			let (keys, children) = {
				let n = node.borrow();
				let children = match &n.body {
					NodeBody::Internal {
						children,
					} => Some(children.clone()),
					NodeBody::Leaf {
						..
					} => None,
				};
				(n.keys.clone(), children)
			};
			assert!(keys.windows(2).all(|w| w[0] <= w[1]), "node keys out of order");
			match children {
				Some(children) => {
					assert_eq!(children.len(), keys.len() + 1);
					for child in children {
						let handle = ctx.fetch(child).unwrap();
						walk(ctx, handle, depth + 1, leaf_depths);
					}
				}
				None => leaf_depths.push(depth),
			}
		}
		walk(&mut ctx, root, 1, &mut leaf_depths);
		assert!(
			leaf_depths.windows(2).all(|w| w[0] == w[1]),
			"leaves at unequal depths: {leaf_depths:?}"
		);

		// leaf chain: sorted end to end, exactly one link per leaf
		let mut visited = 0;
		let mut last_key: Option<Vec<u8>> = None;
		let mut cur = Some(head);
		while let Some(addr) = cur {
			let node = ctx.fetch(addr).unwrap();
			let n = node.borrow();
			for key in &n.keys {
				if let Some(last) = &last_key {
					assert!(last <= key, "leaf chain out of order");
				}
				last_key = Some(key.clone());
			}
			cur = leaf_next(&n);
			visited += 1;
			assert!(visited <= leaf_depths.len(), "leaf chain has a cycle");
		}
		assert_eq!(visited, leaf_depths.len());
	}

	#[test]
	fn tree_shape_invariants_hold_under_load() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = unclustered(&dir);
		let mut rng = StdRng::seed_from_u64(7);
		for i in 0..400 {
			// every fifth key repeats, exercising duplicate runs
			let key = if i % 5 == 0 {
				rng.gen_range(0..40)
			} else {
				rng.gen_range(0..100_000)
			};
			tree.insert(&Key::Int32(key), &Value::Str(format!("p{i}"))).unwrap();
			if i % 97 == 0 {
				assert_invariants(&mut tree);
			}
		}
		assert_invariants(&mut tree);
		tree.close().unwrap();

		let dir2 = tempfile::tempdir().unwrap();
		let mut tree = clustered(&dir2);
		for i in (0..600).rev() {
			tree.insert(&Key::Int32(i), &Value::Int32(i)).unwrap();
		}
		assert_invariants(&mut tree);
		tree.close().unwrap();
	}

	#[test]
	fn int64_byte_keys_and_values_mix() {
		let dir = tempfile::tempdir().unwrap();
		let mut tree = unclustered(&dir);
		for i in 0..300i64 {
			let key = Key::Int64(i * 1_000_003);
			tree.insert(&key, &Value::Int64(i)).unwrap();
		}
		assert_eq!(
			tree.find(&Key::Int64(299 * 1_000_003)).unwrap(),
			Some(Value::Int64(299))
		);
		assert_eq!(tree.find(&Key::Int64(7)).unwrap(), None);
		tree.close().unwrap();
	}
}
