use std::collections::BTreeMap;

use bytes::Bytes;
use rmp::Marker;

use super::{ArrayShapeError, ArrayValue, Dtype, Value};

// Refuse payloads nested deeper than this; the encoding is a tree and sane
// messages are shallow.
const MAX_DEPTH: usize = 128;

/// A decode error.
///
/// All of these cause the message to be dropped while the stream stays open.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
	#[error("malformed payload: {0}")]
	Malformed(&'static str),

	#[error("invalid string: {0}")]
	InvalidString(#[from] std::string::FromUtf8Error),

	#[error("{0}")]
	ArrayShapeMismatch(#[from] ArrayShapeError),

	#[error("unknown dtype: {0:?}")]
	UnknownDtype(String),
}

/// Decode a MessagePack payload, reversing the type-hint wrapping.
///
/// A map with `__ndarray: true` is reconstructed as [Value::Array]; a map
/// with exactly the keys `{__type, data}` unwraps to the inner `data`.
pub fn decode(data: &[u8]) -> Result<Value, DecodeError> {
	let mut input = data;
	let value = read_value(&mut input, 0)?;

	if !input.is_empty() {
		return Err(DecodeError::Malformed("trailing bytes"));
	}

	match value {
		Value::Map(map) => unwrap_map(map),
		other => Ok(other),
	}
}

fn unwrap_map(mut map: BTreeMap<String, Value>) -> Result<Value, DecodeError> {
	if matches!(map.get(Value::NDARRAY_KEY), Some(Value::Bool(true))) {
		return read_ndarray(map).map(Value::Array);
	}

	if map.len() == 2 && map.contains_key(Value::TYPE_KEY) {
		if let Some(data) = map.remove("data") {
			return Ok(data);
		}
	}

	Ok(Value::Map(map))
}

fn read_ndarray(mut map: BTreeMap<String, Value>) -> Result<ArrayValue, DecodeError> {
	let dtype: Dtype = match map.remove("dtype") {
		Some(Value::String(tag)) => tag.parse()?,
		_ => return Err(DecodeError::Malformed("ndarray without dtype")),
	};

	let shape = match map.remove("shape") {
		Some(Value::List(dims)) => {
			let mut shape = Vec::with_capacity(dims.len());
			for dim in dims {
				match dim {
					Value::Int(dim) if dim >= 0 => shape.push(dim as usize),
					_ => return Err(DecodeError::Malformed("ndarray with invalid shape")),
				}
			}
			shape
		}
		_ => return Err(DecodeError::Malformed("ndarray without shape")),
	};

	let data = match map.remove("data") {
		Some(Value::Bytes(data)) => data,
		_ => return Err(DecodeError::Malformed("ndarray without data")),
	};

	Ok(ArrayValue::new(dtype, shape, data)?)
}

fn read_value(input: &mut &[u8], depth: usize) -> Result<Value, DecodeError> {
	if depth > MAX_DEPTH {
		return Err(DecodeError::Malformed("nesting too deep"));
	}

	Ok(match Marker::from_u8(take_u8(input)?) {
		Marker::Null => Value::Null,
		Marker::True => Value::Bool(true),
		Marker::False => Value::Bool(false),

		Marker::FixPos(n) => Value::Int(n as i64),
		Marker::FixNeg(n) => Value::Int(n as i64),
		Marker::U8 => Value::Int(take_u8(input)? as i64),
		Marker::U16 => Value::Int(u16::from_be_bytes(take_arr(input)?) as i64),
		Marker::U32 => Value::Int(u32::from_be_bytes(take_arr(input)?) as i64),
		Marker::U64 => {
			let v = u64::from_be_bytes(take_arr(input)?);
			Value::Int(i64::try_from(v).map_err(|_| DecodeError::Malformed("integer out of range"))?)
		}
		Marker::I8 => Value::Int(i8::from_be_bytes(take_arr(input)?) as i64),
		Marker::I16 => Value::Int(i16::from_be_bytes(take_arr(input)?) as i64),
		Marker::I32 => Value::Int(i32::from_be_bytes(take_arr(input)?) as i64),
		Marker::I64 => Value::Int(i64::from_be_bytes(take_arr(input)?)),

		Marker::F32 => Value::Float(f32::from_be_bytes(take_arr(input)?) as f64),
		Marker::F64 => Value::Float(f64::from_be_bytes(take_arr(input)?)),

		Marker::FixStr(len) => read_str(input, len as usize)?,
		Marker::Str8 => {
			let len = take_u8(input)? as usize;
			read_str(input, len)?
		}
		Marker::Str16 => {
			let len = u16::from_be_bytes(take_arr(input)?) as usize;
			read_str(input, len)?
		}
		Marker::Str32 => {
			let len = u32::from_be_bytes(take_arr(input)?) as usize;
			read_str(input, len)?
		}

		Marker::Bin8 => {
			let len = take_u8(input)? as usize;
			Value::Bytes(Bytes::copy_from_slice(take(input, len)?))
		}
		Marker::Bin16 => {
			let len = u16::from_be_bytes(take_arr(input)?) as usize;
			Value::Bytes(Bytes::copy_from_slice(take(input, len)?))
		}
		Marker::Bin32 => {
			let len = u32::from_be_bytes(take_arr(input)?) as usize;
			Value::Bytes(Bytes::copy_from_slice(take(input, len)?))
		}

		Marker::FixArray(len) => read_list(input, len as usize, depth)?,
		Marker::Array16 => {
			let len = u16::from_be_bytes(take_arr(input)?) as usize;
			read_list(input, len, depth)?
		}
		Marker::Array32 => {
			let len = u32::from_be_bytes(take_arr(input)?) as usize;
			read_list(input, len, depth)?
		}

		Marker::FixMap(len) => read_map(input, len as usize, depth)?,
		Marker::Map16 => {
			let len = u16::from_be_bytes(take_arr(input)?) as usize;
			read_map(input, len, depth)?
		}
		Marker::Map32 => {
			let len = u32::from_be_bytes(take_arr(input)?) as usize;
			read_map(input, len, depth)?
		}

		// Ext types and the reserved marker are not part of the grammar.
		_ => return Err(DecodeError::Malformed("unsupported marker")),
	})
}

fn read_str(input: &mut &[u8], len: usize) -> Result<Value, DecodeError> {
	let bytes = take(input, len)?;
	Ok(Value::String(String::from_utf8(bytes.to_vec())?))
}

fn read_list(input: &mut &[u8], len: usize, depth: usize) -> Result<Value, DecodeError> {
	// Don't trust the declared length for the allocation.
	let mut items = Vec::with_capacity(len.min(1024));
	for _ in 0..len {
		items.push(read_value(input, depth + 1)?);
	}
	Ok(Value::List(items))
}

fn read_map(input: &mut &[u8], len: usize, depth: usize) -> Result<Value, DecodeError> {
	let mut map = BTreeMap::new();
	for _ in 0..len {
		let key = match read_value(input, depth + 1)? {
			Value::String(key) => key,
			_ => return Err(DecodeError::Malformed("non-string map key")),
		};
		map.insert(key, read_value(input, depth + 1)?);
	}
	Ok(Value::Map(map))
}

fn take<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], DecodeError> {
	if input.len() < len {
		return Err(DecodeError::Malformed("truncated payload"));
	}

	let (head, rest) = input.split_at(len);
	*input = rest;
	Ok(head)
}

fn take_u8(input: &mut &[u8]) -> Result<u8, DecodeError> {
	Ok(take(input, 1)?[0])
}

fn take_arr<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], DecodeError> {
	let bytes = take(input, N)?;
	let mut out = [0u8; N];
	out.copy_from_slice(bytes);
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::coding::encode;

	fn roundtrip(value: Value) -> Value {
		decode(&encode(&value, None).unwrap()).unwrap()
	}

	#[test]
	fn roundtrip_scalars() {
		for value in [
			Value::Null,
			Value::Bool(true),
			Value::Bool(false),
			Value::Int(0),
			Value::Int(-1),
			Value::Int(127),
			Value::Int(-33),
			Value::Int(i64::MAX),
			Value::Int(i64::MIN),
			Value::Float(0.25),
			Value::Float(-1e300),
			Value::String("hello".to_string()),
			Value::String("".to_string()),
			Value::Bytes(Bytes::from_static(b"\x00\x01\x02")),
		] {
			assert_eq!(roundtrip(value.clone()), value);
		}
	}

	#[test]
	fn roundtrip_nested() {
		let mut inner = BTreeMap::new();
		inner.insert("b".to_string(), Value::List(vec![Value::Int(2), Value::Int(3)]));

		let mut map = BTreeMap::new();
		map.insert("a".to_string(), Value::Int(1));
		map.insert("nested".to_string(), Value::Map(inner));

		let value = Value::Map(map);
		assert_eq!(roundtrip(value.clone()), value);
	}

	#[test]
	fn roundtrip_long_collections() {
		// Push past the fixstr/fixarray/fixmap ranges.
		let long_string = Value::String("x".repeat(300));
		let long_list = Value::List((0..70_000).map(Value::Int).collect());
		assert_eq!(roundtrip(long_string.clone()), long_string);
		assert_eq!(roundtrip(long_list.clone()), long_list);
	}

	#[test]
	fn roundtrip_ndarray() {
		let array = ArrayValue::new(Dtype::Uint8, vec![480, 640], vec![0u8; 480 * 640]).unwrap();
		let value = Value::Array(array);
		assert_eq!(roundtrip(value.clone()), value);

		let floats = ArrayValue::from_f32(vec![3, 2], &[1.0, -2.0, 3.5, 0.0, -0.25, 9.0]).unwrap();
		let value = Value::Array(floats);
		assert_eq!(roundtrip(value.clone()), value);
	}

	#[test]
	fn ndarray_keeps_type_hint_out_of_the_value() {
		let array = ArrayValue::new(Dtype::Uint8, vec![2], vec![1, 2]).unwrap();
		let encoded = encode(&Value::Array(array.clone()), Some("Image")).unwrap();
		assert_eq!(decode(&encoded).unwrap(), Value::Array(array));
	}

	#[test]
	fn scalar_hint_unwraps() {
		let encoded = encode(&Value::Int(42), Some("Num")).unwrap();
		assert_eq!(decode(&encoded).unwrap(), Value::Int(42));
	}

	#[test]
	fn map_hint_is_visible() {
		let mut map = BTreeMap::new();
		map.insert("x".to_string(), Value::Int(1));
		let encoded = encode(&Value::Map(map), Some("P")).unwrap();

		let mut expected = BTreeMap::new();
		expected.insert(Value::TYPE_KEY.to_string(), Value::String("P".to_string()));
		expected.insert("x".to_string(), Value::Int(1));
		assert_eq!(decode(&encoded).unwrap(), Value::Map(expected));
	}

	#[test]
	fn two_key_map_without_type_is_untouched() {
		let mut map = BTreeMap::new();
		map.insert("data".to_string(), Value::Int(1));
		map.insert("other".to_string(), Value::Int(2));

		let value = Value::Map(map);
		assert_eq!(roundtrip(value.clone()), value);
	}

	#[test]
	fn rejects_truncated() {
		let encoded = encode(&Value::String("hello world".to_string()), None).unwrap();
		assert!(matches!(
			decode(&encoded[..encoded.len() - 1]),
			Err(DecodeError::Malformed(_))
		));
		assert!(matches!(decode(&[]), Err(DecodeError::Malformed(_))));
	}

	#[test]
	fn rejects_trailing_bytes() {
		let mut encoded = encode(&Value::Int(1), None).unwrap().to_vec();
		encoded.push(0xc0);
		assert!(matches!(decode(&encoded), Err(DecodeError::Malformed(_))));
	}

	#[test]
	fn rejects_ext_markers() {
		// fixext1 with type 0
		assert!(matches!(decode(&[0xd4, 0x00, 0x00]), Err(DecodeError::Malformed(_))));
	}

	#[test]
	fn rejects_shape_mismatch() {
		let array = ArrayValue::new(Dtype::Uint8, vec![4], vec![0u8; 4]).unwrap();
		let mut encoded = encode(&Value::Array(array), None).unwrap().to_vec();

		// Truncate the trailing bin payload by patching its length byte.
		let pos = encoded.len() - 5;
		assert_eq!(encoded[pos], 4, "expected the bin8 length here");
		encoded[pos] = 3;
		encoded.pop();

		assert!(matches!(
			decode(&encoded),
			Err(DecodeError::ArrayShapeMismatch(_))
		));
	}

	#[test]
	fn rejects_unknown_dtype() {
		let array = ArrayValue::new(Dtype::Uint8, vec![1], vec![0u8]).unwrap();
		let encoded = encode(&Value::Array(array), None).unwrap();
		let patched = encoded.to_vec().windows(5).any(|w| w == b"uint8");
		assert!(patched);

		let mut bytes = encoded.to_vec();
		let pos = bytes.windows(5).position(|w| w == b"uint8").unwrap();
		bytes[pos..pos + 5].copy_from_slice(b"uint9");

		assert!(matches!(decode(&bytes), Err(DecodeError::UnknownDtype(_))));
	}
}
