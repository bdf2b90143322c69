use crate::error::{Error, Result};

/// Runtime key value. The key kind is locked in by the first insert on a
/// tree; every later key must carry the same kind (and, for `Bytes`, the
/// same length).
#[derive(Clone, Debug, PartialEq)]
pub enum Key {
	Int32(i32),
	Int64(i64),
	Float64(f64),
	Bytes(Vec<u8>),
}

/// Runtime value. Which kinds a tree accepts depends on its storage
/// strategy; see `ValueMode::check_value_kind`.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
	Int32(i32),
	Int64(i64),
	Float64(f64),
	Str(String),
	Bytes(Vec<u8>),
}

/// Closed set of key kinds. `Bytes` carries its fixed width.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyKind {
	Int32,
	Int64,
	Float64,
	Bytes(u16),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueKind {
	Int32,
	Int64,
	Float64,
	Str,
	Bytes,
}

impl KeyKind {
	/// Width in bytes of one encoded key.
	pub fn width(&self) -> usize {
		match self {
			KeyKind::Int32 => 4,
			KeyKind::Int64 => 8,
			KeyKind::Float64 => 8,
			KeyKind::Bytes(len) => *len as usize,
		}
	}

	pub(crate) fn tag(&self) -> u8 {
		match self {
			KeyKind::Int32 => 1,
			KeyKind::Int64 => 2,
			KeyKind::Float64 => 3,
			KeyKind::Bytes(_) => 4,
		}
	}

	pub(crate) fn from_tag(tag: u8, width: u16) -> Result<Self> {
		match tag {
			1 => Ok(KeyKind::Int32),
			2 => Ok(KeyKind::Int64),
			3 => Ok(KeyKind::Float64),
			4 => Ok(KeyKind::Bytes(width)),
			_ => Err(Error::CorruptMetadata(format!("unknown key kind tag {tag}"))),
		}
	}
}

impl ValueKind {
	pub(crate) fn tag(&self) -> u8 {
		match self {
			ValueKind::Int32 => 1,
			ValueKind::Int64 => 2,
			ValueKind::Float64 => 3,
			ValueKind::Str => 4,
			ValueKind::Bytes => 5,
		}
	}

	pub(crate) fn from_tag(tag: u8) -> Result<Self> {
		match tag {
			1 => Ok(ValueKind::Int32),
			2 => Ok(ValueKind::Int64),
			3 => Ok(ValueKind::Float64),
			4 => Ok(ValueKind::Str),
			5 => Ok(ValueKind::Bytes),
			_ => Err(Error::CorruptMetadata(format!("unknown value kind tag {tag}"))),
		}
	}
}

impl Key {
	pub fn kind(&self) -> KeyKind {
		match self {
			Key::Int32(_) => KeyKind::Int32,
			Key::Int64(_) => KeyKind::Int64,
			Key::Float64(_) => KeyKind::Float64,
			Key::Bytes(b) => KeyKind::Bytes(b.len() as u16),
		}
	}

	/// Encode into a fixed-width, order-preserving byte string: comparing
	/// two encoded keys with a plain byte comparison orders them the same
	/// way the runtime values order. Integers get a flipped sign bit in
	/// big-endian form; doubles get the total-order transform.
	pub fn encode(&self) -> Vec<u8> {
		match self {
			Key::Int32(v) => ((*v as u32) ^ (1 << 31)).to_be_bytes().to_vec(),
			Key::Int64(v) => ((*v as u64) ^ (1 << 63)).to_be_bytes().to_vec(),
			Key::Float64(v) => {
				let bits = v.to_bits();
				let ordered = if bits >> 63 == 1 {
					!bits
				} else {
					bits | (1 << 63)
				};
				ordered.to_be_bytes().to_vec()
			}
			Key::Bytes(b) => b.clone(),
		}
	}
}

impl KeyKind {
	/// Reverse of `Key::encode`.
	pub fn decode(&self, data: &[u8]) -> Result<Key> {
		if data.len() != self.width() {
			return Err(Error::Corruption(format!(
				"encoded key is {} bytes, expected {}",
				data.len(),
				self.width()
			)));
		}
		match self {
			KeyKind::Int32 => {
				let raw = u32::from_be_bytes(data.try_into().unwrap());
				Ok(Key::Int32((raw ^ (1 << 31)) as i32))
			}
			KeyKind::Int64 => {
				let raw = u64::from_be_bytes(data.try_into().unwrap());
				Ok(Key::Int64((raw ^ (1 << 63)) as i64))
			}
			KeyKind::Float64 => {
				let ordered = u64::from_be_bytes(data.try_into().unwrap());
				let bits = if ordered >> 63 == 1 {
					ordered & !(1 << 63)
				} else {
					!ordered
				};
				Ok(Key::Float64(f64::from_bits(bits)))
			}
			KeyKind::Bytes(_) => Ok(Key::Bytes(data.to_vec())),
		}
	}
}

impl Value {
	pub fn kind(&self) -> ValueKind {
		match self {
			Value::Int32(_) => ValueKind::Int32,
			Value::Int64(_) => ValueKind::Int64,
			Value::Float64(_) => ValueKind::Float64,
			Value::Str(_) => ValueKind::Str,
			Value::Bytes(_) => ValueKind::Bytes,
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		match self {
			Value::Int32(v) => v.to_be_bytes().to_vec(),
			Value::Int64(v) => v.to_be_bytes().to_vec(),
			Value::Float64(v) => v.to_be_bytes().to_vec(),
			Value::Str(s) => s.as_bytes().to_vec(),
			Value::Bytes(b) => b.clone(),
		}
	}
}

impl ValueKind {
	/// Decode a value from the bytes an entry (or a concatenated run of
	/// chunk entries) resolved to. Numeric kinds read their fixed prefix,
	/// matching how the original materialized typed results.
	pub fn decode(&self, data: &[u8]) -> Result<Value> {
		match self {
			ValueKind::Int32 => {
				if data.len() < 4 {
					return Err(Error::Corruption("int32 value shorter than 4 bytes".into()));
				}
				Ok(Value::Int32(i32::from_be_bytes(data[..4].try_into().unwrap())))
			}
			ValueKind::Int64 => {
				if data.len() < 8 {
					return Err(Error::Corruption("int64 value shorter than 8 bytes".into()));
				}
				Ok(Value::Int64(i64::from_be_bytes(data[..8].try_into().unwrap())))
			}
			ValueKind::Float64 => {
				if data.len() < 8 {
					return Err(Error::Corruption("float64 value shorter than 8 bytes".into()));
				}
				Ok(Value::Float64(f64::from_be_bytes(data[..8].try_into().unwrap())))
			}
			ValueKind::Str => String::from_utf8(data.to_vec())
				.map(Value::Str)
				.map_err(|_| Error::Corruption("string value is not valid UTF-8".into())),
			ValueKind::Bytes => Ok(Value::Bytes(data.to_vec())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_log::test;

	#[test]
	fn int_keys_order_bytewise() {
		let samples = [i32::MIN, -100, -1, 0, 1, 42, i32::MAX - 1];
		for w in samples.windows(2) {
			let a = Key::Int32(w[0]).encode();
			let b = Key::Int32(w[1]).encode();
			assert!(a < b, "{} should encode below {}", w[0], w[1]);
		}
	}

	#[test]
	fn long_keys_order_bytewise() {
		let samples = [i64::MIN, -5_000_000_000, -1, 0, 7, i64::MAX - 1];
		for w in samples.windows(2) {
			assert!(Key::Int64(w[0]).encode() < Key::Int64(w[1]).encode());
		}
	}

	#[test]
	fn double_keys_order_bytewise() {
		let samples = [f64::NEG_INFINITY, -1.5e10, -0.25, 0.0, 1.0, 3.75, f64::INFINITY];
		for w in samples.windows(2) {
			assert!(Key::Float64(w[0]).encode() < Key::Float64(w[1]).encode());
		}
	}

	#[test]
	fn key_round_trips() {
		for key in [Key::Int32(-7), Key::Int64(1 << 40), Key::Float64(-2.5)] {
			let kind = key.kind();
			let decoded = kind.decode(&key.encode()).unwrap();
			assert_eq!(decoded, key);
		}
		let key = Key::Bytes(vec![1, 2, 3, 4]);
		assert_eq!(key.kind().decode(&key.encode()).unwrap(), key);
	}

	#[test]
	fn value_round_trips() {
		let v = Value::Str("hello".into());
		assert_eq!(ValueKind::Str.decode(&v.encode()).unwrap(), v);
		let v = Value::Int32(-12);
		assert_eq!(ValueKind::Int32.decode(&v.encode()).unwrap(), v);
	}
}
