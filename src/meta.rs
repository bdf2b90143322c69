use std::io;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::alloc::NodeAddr;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::types::{KeyKind, ValueKind};

const MAGIC: [u8; 8] = *b"PGTREE01";
const VERSION: u32 = 1;

/// Everything `close()` persists besides the page file itself: the shape
/// configuration, the locked-in types, allocation cursors and the
/// serialized root node. A tree closed before its first insert stores only
/// the configuration (`state == None`).
#[derive(Debug, PartialEq)]
pub(crate) struct Metadata {
	pub mode_tag: u8,
	pub options: Options,
	pub state: Option<MetaState>,
}

#[derive(Debug, PartialEq)]
pub(crate) struct MetaState {
	pub key_kind: KeyKind,
	pub value_kind: ValueKind,
	pub value_width: u16,
	pub depth: u16,
	pub entry_count: u64,
	pub head: NodeAddr,
	pub tail: NodeAddr,
	pub root: NodeAddr,
	pub root_page_type: u8,
	pub root_bytes: Vec<u8>,
	pub internal_cursor: (u32, u16),
	pub leaf_cursor: (u32, u16),
	pub data_cursor: Option<(u32, u32)>,
}

impl Metadata {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();
		// infallible: writing to a Vec
		self.write_to(&mut out).expect("metadata encoding cannot fail");
		let crc = crc32fast::hash(&out);
		out.write_u32::<BigEndian>(crc).expect("metadata encoding cannot fail");
		out
	}

	fn write_to(&self, out: &mut Vec<u8>) -> io::Result<()> {
		use io::Write;

		out.write_all(&MAGIC)?;
		out.write_u32::<BigEndian>(VERSION)?;
		out.write_u8(self.mode_tag)?;

		out.write_u32::<BigEndian>(self.options.page_size as u32)?;
		out.write_u16::<BigEndian>(self.options.nodes_per_page as u16)?;
		out.write_u32::<BigEndian>(self.options.node_cache_capacity as u32)?;
		out.write_u32::<BigEndian>(self.options.page_cache_capacity as u32)?;
		out.write_u32::<BigEndian>(self.options.data_cache_capacity as u32)?;
		out.write_f32::<BigEndian>(self.options.cache_factor)?;

		match &self.state {
			None => out.write_u8(0)?,
			Some(state) => {
				out.write_u8(1)?;
				out.write_u8(state.key_kind.tag())?;
				out.write_u16::<BigEndian>(state.key_kind.width() as u16)?;
				out.write_u8(state.value_kind.tag())?;
				out.write_u16::<BigEndian>(state.value_width)?;
				out.write_u16::<BigEndian>(state.depth)?;
				out.write_u64::<BigEndian>(state.entry_count)?;
				out.write_u64::<BigEndian>(state.head.pack())?;
				out.write_u64::<BigEndian>(state.tail.pack())?;
				out.write_u64::<BigEndian>(state.root.pack())?;
				out.write_u32::<BigEndian>(state.internal_cursor.0)?;
				out.write_u16::<BigEndian>(state.internal_cursor.1)?;
				out.write_u32::<BigEndian>(state.leaf_cursor.0)?;
				out.write_u16::<BigEndian>(state.leaf_cursor.1)?;
				match state.data_cursor {
					None => out.write_u8(0)?,
					Some((page, offset)) => {
						out.write_u8(1)?;
						out.write_u32::<BigEndian>(page)?;
						out.write_u32::<BigEndian>(offset)?;
					}
				}
				out.write_u8(state.root_page_type)?;
				out.write_u32::<BigEndian>(state.root_bytes.len() as u32)?;
				out.write_all(&state.root_bytes)?;
			}
		}
		Ok(())
	}

	pub fn decode(data: &[u8]) -> Result<Metadata> {
		if data.len() < MAGIC.len() + 4 + 4 {
			return Err(Error::CorruptMetadata("metadata file is truncated".into()));
		}
		let (payload, trailer) = data.split_at(data.len() - 4);
		let stored_crc = u32::from_be_bytes(trailer.try_into().unwrap());
		if crc32fast::hash(payload) != stored_crc {
			return Err(Error::CorruptMetadata("metadata checksum mismatch".into()));
		}
		Self::read_from(&mut &payload[..])
	}

	fn read_from(r: &mut &[u8]) -> Result<Metadata> {
		let mut magic = [0u8; 8];
		rd(io::Read::read_exact(r, &mut magic))?;
		if magic != MAGIC {
			return Err(Error::CorruptMetadata("bad magic number".into()));
		}
		let version = rd(r.read_u32::<BigEndian>())?;
		if version != VERSION {
			return Err(Error::CorruptMetadata(format!("unsupported metadata version {version}")));
		}
		let mode_tag = rd(r.read_u8())?;

		let options = Options {
			page_size: rd(r.read_u32::<BigEndian>())? as usize,
			nodes_per_page: rd(r.read_u16::<BigEndian>())? as usize,
			node_cache_capacity: rd(r.read_u32::<BigEndian>())? as usize,
			page_cache_capacity: rd(r.read_u32::<BigEndian>())? as usize,
			data_cache_capacity: rd(r.read_u32::<BigEndian>())? as usize,
			cache_factor: rd(r.read_f32::<BigEndian>())?,
		};

		let state = match rd(r.read_u8())? {
			0 => None,
			1 => {
				let key_tag = rd(r.read_u8())?;
				let key_width = rd(r.read_u16::<BigEndian>())?;
				let key_kind = KeyKind::from_tag(key_tag, key_width)?;
				let value_kind = ValueKind::from_tag(rd(r.read_u8())?)?;
				let value_width = rd(r.read_u16::<BigEndian>())?;
				let depth = rd(r.read_u16::<BigEndian>())?;
				let entry_count = rd(r.read_u64::<BigEndian>())?;
				let head = NodeAddr::unpack(rd(r.read_u64::<BigEndian>())?);
				let tail = NodeAddr::unpack(rd(r.read_u64::<BigEndian>())?);
				let root = NodeAddr::unpack(rd(r.read_u64::<BigEndian>())?);
				let internal_cursor =
					(rd(r.read_u32::<BigEndian>())?, rd(r.read_u16::<BigEndian>())?);
				let leaf_cursor = (rd(r.read_u32::<BigEndian>())?, rd(r.read_u16::<BigEndian>())?);
				let data_cursor = match rd(r.read_u8())? {
					0 => None,
					1 => Some((rd(r.read_u32::<BigEndian>())?, rd(r.read_u32::<BigEndian>())?)),
					other => {
						return Err(Error::CorruptMetadata(format!(
							"bad data cursor flag {other}"
						)))
					}
				};
				let root_page_type = rd(r.read_u8())?;
				let root_len = rd(r.read_u32::<BigEndian>())? as usize;
				if r.len() != root_len {
					return Err(Error::CorruptMetadata(format!(
						"root node length {root_len} does not match remaining {} bytes",
						r.len()
					)));
				}
				let root_bytes = r.to_vec();
				Some(MetaState {
					key_kind,
					value_kind,
					value_width,
					depth,
					entry_count,
					head,
					tail,
					root,
					root_page_type,
					root_bytes,
					internal_cursor,
					leaf_cursor,
					data_cursor,
				})
			}
			other => return Err(Error::CorruptMetadata(format!("bad state flag {other}"))),
		};

		Ok(Metadata {
			mode_tag,
			options,
			state,
		})
	}
}

fn rd<T>(res: io::Result<T>) -> Result<T> {
	res.map_err(|_| Error::CorruptMetadata("metadata file is truncated".into()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_log::test;

	fn sample() -> Metadata {
		Metadata {
			mode_tag: 2,
			options: Options::default(),
			state: Some(MetaState {
				key_kind: KeyKind::Int32,
				value_kind: ValueKind::Str,
				value_width: 0,
				depth: 3,
				entry_count: 1000,
				head: NodeAddr {
					page: 1,
					slot: 0,
				},
				tail: NodeAddr {
					page: 8,
					slot: 2,
				},
				root: NodeAddr {
					page: 6,
					slot: 0,
				},
				root_page_type: crate::page::PAGE_INTERNAL,
				root_bytes: vec![3; 122],
				internal_cursor: (6, 1),
				leaf_cursor: (9, 0),
				data_cursor: Some((11, 412)),
			}),
		}
	}

	#[test]
	fn metadata_round_trips() {
		let meta = sample();
		assert_eq!(Metadata::decode(&meta.encode()).unwrap(), meta);
	}

	#[test]
	fn uninitialized_metadata_round_trips() {
		let meta = Metadata {
			mode_tag: 1,
			options: Options::default(),
			state: None,
		};
		assert_eq!(Metadata::decode(&meta.encode()).unwrap(), meta);
	}

	#[test]
	fn flipped_bit_fails_the_checksum() {
		let mut bytes = sample().encode();
		bytes[20] ^= 0x40;
		assert!(matches!(Metadata::decode(&bytes), Err(Error::CorruptMetadata(_))));
	}

	#[test]
	fn truncated_metadata_is_rejected() {
		let bytes = sample().encode();
		assert!(matches!(Metadata::decode(&bytes[..10]), Err(Error::CorruptMetadata(_))));
	}

	#[test]
	fn bad_magic_is_rejected() {
		let mut bytes = sample().encode();
		bytes[0] = b'X';
		// fix the checksum so the magic check itself is what trips
		let crc = crc32fast::hash(&bytes[..bytes.len() - 4]);
		let at = bytes.len() - 4;
		bytes[at..].copy_from_slice(&crc.to_be_bytes());
		let err = Metadata::decode(&bytes).unwrap_err();
		assert!(matches!(err, Error::CorruptMetadata(msg) if msg.contains("magic")));
	}
}
