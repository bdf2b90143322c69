use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bytes::{Buf, BufMut};

use crate::alloc::NodeAddr;
use crate::error::{Error, Result};
use crate::page::{PAGE_INTERNAL, PAGE_LEAF};

/// parent (8) + logical size (2) + self address (8)
const NODE_HEADER_SIZE: usize = 18;
/// prev (8) + next (8), leaf slots only
const LEAF_LINKS_SIZE: usize = 16;

/// Unused trailing key slots are filled with this byte so a decoder can
/// recover the used count without trusting the stored size field.
const PAD: u8 = 0xff;

pub(crate) type NodeHandle = Rc<RefCell<Node>>;

/// Derived slot geometry for one tree: how many keys each node kind holds,
/// how large its serialized slot is and how many slots fit in a page. All
/// of it follows from the page size, the requested slots-per-page packing
/// and the two locked-in element widths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
	pub page_size: usize,
	pub key_width: usize,
	pub value_slot_width: usize,
	pub internal_cap: usize,
	pub leaf_cap: usize,
	pub internal_slot_size: usize,
	pub leaf_slot_size: usize,
	pub internal_per_page: u16,
	pub leaf_per_page: u16,
}

impl Layout {
	pub fn new(
		page_size: usize,
		nodes_per_page: usize,
		key_width: usize,
		value_slot_width: usize,
	) -> Result<Self> {
		let budget = (page_size - 1) / nodes_per_page;
		let internal_cap = budget
			.checked_sub(NODE_HEADER_SIZE + 8)
			.map(|b| b / (key_width + 8))
			.unwrap_or(0);
		let leaf_cap = budget
			.checked_sub(NODE_HEADER_SIZE + LEAF_LINKS_SIZE)
			.map(|b| b / (key_width + value_slot_width))
			.unwrap_or(0);
		if internal_cap < 2 || leaf_cap < 2 {
			return Err(Error::InvalidArgument(format!(
				"page_size {page_size} / nodes_per_page {nodes_per_page} leaves no room for \
				 nodes with {key_width} byte keys and {value_slot_width} byte value slots"
			)));
		}
		let internal_slot_size = NODE_HEADER_SIZE + internal_cap * key_width + (internal_cap + 1) * 8;
		let leaf_slot_size =
			NODE_HEADER_SIZE + LEAF_LINKS_SIZE + leaf_cap * (key_width + value_slot_width);
		Ok(Layout {
			page_size,
			key_width,
			value_slot_width,
			internal_cap,
			leaf_cap,
			internal_slot_size,
			leaf_slot_size,
			internal_per_page: ((page_size - 1) / internal_slot_size) as u16,
			leaf_per_page: ((page_size - 1) / leaf_slot_size) as u16,
		})
	}

	pub fn slot_size(&self, page_type: u8) -> usize {
		if page_type == PAGE_LEAF {
			self.leaf_slot_size
		} else {
			self.internal_slot_size
		}
	}
}

#[derive(Debug)]
pub(crate) enum NodeBody {
	Internal {
		children: Vec<NodeAddr>,
	},
	Leaf {
		values: Vec<Vec<u8>>,
		prev: Option<NodeAddr>,
		next: Option<NodeAddr>,
	},
}

/// One deserialized tree node. `dirty` and `pinned` live in `Cell`s so the
/// caches can flip them through a shared borrow while the node sits inside
/// an `Rc<RefCell<_>>`.
#[derive(Debug)]
pub(crate) struct Node {
	pub addr: NodeAddr,
	pub parent: Option<NodeAddr>,
	pub keys: Vec<Vec<u8>>,
	pub body: NodeBody,
	dirty: Cell<bool>,
	pinned: Cell<bool>,
}

impl Node {
	pub fn new_internal(addr: NodeAddr) -> Node {
		Node {
			addr,
			parent: None,
			keys: Vec::new(),
			body: NodeBody::Internal {
				children: Vec::new(),
			},
			dirty: Cell::new(true),
			pinned: Cell::new(false),
		}
	}

	pub fn new_leaf(addr: NodeAddr) -> Node {
		Node {
			addr,
			parent: None,
			keys: Vec::new(),
			body: NodeBody::Leaf {
				values: Vec::new(),
				prev: None,
				next: None,
			},
			dirty: Cell::new(true),
			pinned: Cell::new(false),
		}
	}

	pub fn is_leaf(&self) -> bool {
		matches!(self.body, NodeBody::Leaf { .. })
	}

	pub fn page_type(&self) -> u8 {
		if self.is_leaf() {
			PAGE_LEAF
		} else {
			PAGE_INTERNAL
		}
	}

	pub fn len(&self) -> usize {
		self.keys.len()
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty.get()
	}

	pub fn mark_dirty(&self) {
		self.dirty.set(true);
	}

	pub fn clear_dirty(&self) {
		self.dirty.set(false);
	}

	pub fn is_pinned(&self) -> bool {
		self.pinned.get()
	}

	pub fn pin(&self) {
		self.pinned.set(true);
	}

	pub fn unpin(&self) {
		self.pinned.set(false);
	}

	/// Serialize into a node slot. `out` must be exactly this node kind's
	/// slot size for the layout.
	pub fn encode_into(&self, mut out: &mut [u8], layout: &Layout) {
		let kw = layout.key_width;
		out.put_u64(NodeAddr::pack_opt(self.parent));
		out.put_u16(self.keys.len() as u16);
		out.put_u64(self.addr.pack());
		match &self.body {
			NodeBody::Internal {
				children,
			} => {
				for key in &self.keys {
					out.put_slice(key);
				}
				out.put_bytes(PAD, (layout.internal_cap - self.keys.len()) * kw);
				for child in children {
					out.put_u64(child.pack());
				}
				out.put_bytes(PAD, (layout.internal_cap + 1 - children.len()) * 8);
			}
			NodeBody::Leaf {
				values,
				prev,
				next,
			} => {
				out.put_u64(NodeAddr::pack_opt(*prev));
				out.put_u64(NodeAddr::pack_opt(*next));
				for key in &self.keys {
					out.put_slice(key);
				}
				out.put_bytes(PAD, (layout.leaf_cap - self.keys.len()) * kw);
				for value in values {
					out.put_slice(value);
				}
				out.put_bytes(PAD, (layout.leaf_cap - values.len()) * layout.value_slot_width);
			}
		}
	}

	/// Decode one node slot. The used count is the smaller of the stored
	/// size and the run of non-sentinel key slots, so a slot whose size
	/// field lies (after a partial write) never yields phantom entries.
	pub fn decode(slot: &[u8], page_type: u8, layout: &Layout) -> Result<Node> {
		let kw = layout.key_width;
		let mut header = slot;
		let parent = NodeAddr::unpack_opt(header.get_u64());
		let stored = header.get_u16() as usize;
		let addr = NodeAddr::unpack(header.get_u64());

		match page_type {
			PAGE_INTERNAL => {
				let cap = layout.internal_cap;
				let keys_area = &slot[NODE_HEADER_SIZE..NODE_HEADER_SIZE + cap * kw];
				let keys = read_keys(keys_area, stored.min(cap), kw);
				let mut children_area = &slot[NODE_HEADER_SIZE + cap * kw..];
				let mut children = Vec::with_capacity(keys.len() + 1);
				for _ in 0..keys.len() + 1 {
					children.push(NodeAddr::unpack(children_area.get_u64()));
				}
				Ok(Node {
					addr,
					parent,
					keys,
					body: NodeBody::Internal {
						children,
					},
					dirty: Cell::new(false),
					pinned: Cell::new(false),
				})
			}
			PAGE_LEAF => {
				let cap = layout.leaf_cap;
				let vw = layout.value_slot_width;
				let mut links = &slot[NODE_HEADER_SIZE..];
				let prev = NodeAddr::unpack_opt(links.get_u64());
				let next = NodeAddr::unpack_opt(links.get_u64());
				let keys_off = NODE_HEADER_SIZE + LEAF_LINKS_SIZE;
				let keys = read_keys(&slot[keys_off..keys_off + cap * kw], stored.min(cap), kw);
				let values_off = keys_off + cap * kw;
				let mut values = Vec::with_capacity(keys.len());
				for i in 0..keys.len() {
					values.push(slot[values_off + i * vw..values_off + (i + 1) * vw].to_vec());
				}
				Ok(Node {
					addr,
					parent,
					keys,
					body: NodeBody::Leaf {
						values,
						prev,
						next,
					},
					dirty: Cell::new(false),
					pinned: Cell::new(false),
				})
			}
			other => Err(Error::Corruption(format!("page type {other} does not hold nodes"))),
		}
	}

	pub(crate) fn internal_children(&self) -> &Vec<NodeAddr> {
		match &self.body {
			NodeBody::Internal {
				children,
			} => children,
			NodeBody::Leaf {
				..
			} => unreachable!("leaf nodes have no children"),
		}
	}

	pub(crate) fn internal_children_mut(&mut self) -> &mut Vec<NodeAddr> {
		match &mut self.body {
			NodeBody::Internal {
				children,
			} => children,
			NodeBody::Leaf {
				..
			} => unreachable!("leaf nodes have no children"),
		}
	}
}

fn read_keys(area: &[u8], limit: usize, key_width: usize) -> Vec<Vec<u8>> {
	let mut keys = Vec::with_capacity(limit);
	for i in 0..limit {
		let raw = &area[i * key_width..(i + 1) * key_width];
		if raw.iter().all(|b| *b == PAD) {
			break;
		}
		keys.push(raw.to_vec());
	}
	keys
}

/// True when a key's encoding collides with the slot padding sentinel and
/// therefore cannot be stored.
pub(crate) fn is_sentinel_key(encoded: &[u8]) -> bool {
	encoded.iter().all(|b| *b == PAD)
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_log::test;

	fn layout() -> Layout {
		// 4 byte keys, 8 byte value slots
		Layout::new(256, 2, 4, 8).unwrap()
	}

	#[test]
	fn layout_geometry() {
		let l = layout();
		assert!(l.internal_cap >= 2 && l.leaf_cap >= 2);
		assert!(l.internal_slot_size <= (l.page_size - 1));
		assert!(l.internal_per_page >= 1 && l.leaf_per_page >= 1);
	}

	#[test]
	fn layout_rejects_tiny_pages() {
		assert!(matches!(Layout::new(64, 8, 8, 8), Err(Error::InvalidArgument(_))));
	}

	#[test]
	fn internal_round_trip() {
		let l = layout();
		let mut node = Node::new_internal(NodeAddr {
			page: 0,
			slot: 1,
		});
		node.parent = Some(NodeAddr {
			page: 5,
			slot: 0,
		});
		node.keys = vec![vec![0, 0, 0, 1], vec![0, 0, 0, 9]];
		*node.internal_children_mut() = vec![
			NodeAddr {
				page: 1,
				slot: 0,
			},
			NodeAddr {
				page: 1,
				slot: 1,
			},
			NodeAddr {
				page: 3,
				slot: 0,
			},
		];

		let mut buf = vec![0u8; l.internal_slot_size];
		node.encode_into(&mut buf, &l);
		let back = Node::decode(&buf, PAGE_INTERNAL, &l).unwrap();
		assert_eq!(back.addr, node.addr);
		assert_eq!(back.parent, node.parent);
		assert_eq!(back.keys, node.keys);
		assert_eq!(back.internal_children(), node.internal_children());
		assert!(!back.is_dirty());
	}

	#[test]
	fn leaf_round_trip() {
		let l = layout();
		let mut node = Node::new_leaf(NodeAddr {
			page: 1,
			slot: 2,
		});
		node.keys = vec![vec![0, 0, 0, 2], vec![0, 0, 0, 3], vec![0, 0, 0, 3]];
		match &mut node.body {
			NodeBody::Leaf {
				values,
				prev,
				next,
			} => {
				*values = vec![vec![1; 8], vec![2; 8], vec![3; 8]];
				*prev = Some(NodeAddr {
					page: 1,
					slot: 1,
				});
				*next = None;
			}
			_ => unreachable!(),
		}

		let mut buf = vec![0u8; l.leaf_slot_size];
		node.encode_into(&mut buf, &l);
		let back = Node::decode(&buf, PAGE_LEAF, &l).unwrap();
		assert_eq!(back.keys, node.keys);
		match back.body {
			NodeBody::Leaf {
				values,
				prev,
				next,
			} => {
				assert_eq!(values, vec![vec![1; 8], vec![2; 8], vec![3; 8]]);
				assert_eq!(
					prev,
					Some(NodeAddr {
						page: 1,
						slot: 1,
					})
				);
				assert_eq!(next, None);
			}
			_ => unreachable!(),
		}
	}

	#[test]
	fn decode_stops_at_sentinel_even_if_size_lies() {
		let l = layout();
		let mut node = Node::new_leaf(NodeAddr {
			page: 1,
			slot: 0,
		});
		node.keys = vec![vec![0, 0, 0, 7]];
		match &mut node.body {
			NodeBody::Leaf {
				values,
				..
			} => values.push(vec![9; 8]),
			_ => unreachable!(),
		}

		let mut buf = vec![0u8; l.leaf_slot_size];
		node.encode_into(&mut buf, &l);
		// corrupt the size field to claim more entries than exist
		buf[8..10].copy_from_slice(&5u16.to_be_bytes());
		let back = Node::decode(&buf, PAGE_LEAF, &l).unwrap();
		assert_eq!(back.len(), 1);
		assert_eq!(back.keys[0], vec![0, 0, 0, 7]);
	}

	#[test]
	fn sentinel_key_detection() {
		assert!(is_sentinel_key(&[0xff; 4]));
		assert!(!is_sentinel_key(&[0xff, 0xff, 0xff, 0]));
	}
}
