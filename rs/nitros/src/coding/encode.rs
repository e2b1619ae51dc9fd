use std::collections::BTreeMap;

use bytes::Bytes;
use rmp::encode::{self, ValueWriteError};

use super::{ArrayValue, Value};

/// An encode error.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
	#[error("collection too large to encode")]
	TooLarge,

	#[error("write failed: {0}")]
	Io(#[from] std::io::Error),
}

impl From<ValueWriteError> for EncodeError {
	fn from(err: ValueWriteError) -> Self {
		match err {
			ValueWriteError::InvalidMarkerWrite(err) | ValueWriteError::InvalidDataWrite(err) => Self::Io(err),
		}
	}
}

/// Encode a value as MessagePack, applying the type-hint wrapping.
///
/// With a hint, maps gain a leading `__type` entry and everything else (bar
/// arrays, which carry the hint alongside their sidechannel keys) is wrapped
/// as `{__type, data}`. The peer's decoder reverses the wrapping.
pub fn encode(value: &Value, type_hint: Option<&str>) -> Result<Bytes, EncodeError> {
	let mut buf = Vec::with_capacity(64);

	match (value, type_hint) {
		(Value::Array(array), hint) => write_ndarray(&mut buf, array, hint)?,
		(Value::Map(map), hint @ Some(_)) => write_map(&mut buf, map, hint)?,
		(value, Some(hint)) => {
			encode::write_map_len(&mut buf, 2)?;
			encode::write_str(&mut buf, Value::TYPE_KEY)?;
			encode::write_str(&mut buf, hint)?;
			encode::write_str(&mut buf, "data")?;
			write_value(&mut buf, value)?;
		}
		(value, None) => write_value(&mut buf, value)?,
	}

	Ok(Bytes::from(buf))
}

fn write_value(buf: &mut Vec<u8>, value: &Value) -> Result<(), EncodeError> {
	match value {
		Value::Null => encode::write_nil(buf)?,
		Value::Bool(v) => encode::write_bool(buf, *v)?,
		Value::Int(v) => {
			encode::write_sint(buf, *v)?;
		}
		Value::Float(v) => encode::write_f64(buf, *v)?,
		Value::String(v) => encode::write_str(buf, v)?,
		Value::Bytes(v) => encode::write_bin(buf, v)?,
		Value::List(items) => {
			let len = u32::try_from(items.len()).map_err(|_| EncodeError::TooLarge)?;
			encode::write_array_len(buf, len)?;
			for item in items {
				write_value(buf, item)?;
			}
		}
		Value::Map(map) => write_map(buf, map, None)?,
		Value::Array(array) => write_ndarray(buf, array, None)?,
	}

	Ok(())
}

// The `__type` key is always emitted first; an explicit `__type` entry in the
// map wins over the caller's hint.
fn write_map(buf: &mut Vec<u8>, map: &BTreeMap<String, Value>, hint: Option<&str>) -> Result<(), EncodeError> {
	let own = map.get(Value::TYPE_KEY);
	let extra = own.is_none() && hint.is_some();

	let len = u32::try_from(map.len() + extra as usize).map_err(|_| EncodeError::TooLarge)?;
	encode::write_map_len(buf, len)?;

	if let Some(value) = own {
		encode::write_str(buf, Value::TYPE_KEY)?;
		write_value(buf, value)?;
	} else if let Some(hint) = hint {
		encode::write_str(buf, Value::TYPE_KEY)?;
		encode::write_str(buf, hint)?;
	}

	for (key, value) in map {
		if key == Value::TYPE_KEY {
			continue;
		}
		encode::write_str(buf, key)?;
		write_value(buf, value)?;
	}

	Ok(())
}

// The sidechannel form: the raw element bytes travel as one bin blob, never
// element by element.
fn write_ndarray(buf: &mut Vec<u8>, array: &ArrayValue, hint: Option<&str>) -> Result<(), EncodeError> {
	encode::write_map_len(buf, 4 + hint.is_some() as u32)?;

	if let Some(hint) = hint {
		encode::write_str(buf, Value::TYPE_KEY)?;
		encode::write_str(buf, hint)?;
	}

	encode::write_str(buf, Value::NDARRAY_KEY)?;
	encode::write_bool(buf, true)?;

	encode::write_str(buf, "dtype")?;
	encode::write_str(buf, array.dtype().as_str())?;

	encode::write_str(buf, "shape")?;
	let dims = u32::try_from(array.shape().len()).map_err(|_| EncodeError::TooLarge)?;
	encode::write_array_len(buf, dims)?;
	for dim in array.shape() {
		encode::write_sint(buf, *dim as i64)?;
	}

	encode::write_str(buf, "data")?;
	encode::write_bin(buf, array.data())?;

	Ok(())
}
