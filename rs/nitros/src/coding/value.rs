use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use super::decode::DecodeError;

/// A dynamically typed message payload.
///
/// Publishers and subscribers exchange heterogeneous values; this tagged
/// union is the in-memory form of everything the structured encoding can
/// carry. Dense numeric data takes the [Array](Value::Array) variant, which
/// travels as a single binary blob instead of element-by-element.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	String(String),
	Bytes(Bytes),
	List(Vec<Value>),
	Map(BTreeMap<String, Value>),
	Array(ArrayValue),
}

impl Value {
	/// The reserved map key carrying an application type name.
	pub const TYPE_KEY: &'static str = "__type";

	/// The reserved map key marking the numeric-array sidechannel.
	pub const NDARRAY_KEY: &'static str = "__ndarray";
}

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Self::Bool(v)
	}
}

impl From<i32> for Value {
	fn from(v: i32) -> Self {
		Self::Int(v as i64)
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Self::Int(v)
	}
}

impl From<u32> for Value {
	fn from(v: u32) -> Self {
		Self::Int(v as i64)
	}
}

impl From<f32> for Value {
	fn from(v: f32) -> Self {
		Self::Float(v as f64)
	}
}

impl From<f64> for Value {
	fn from(v: f64) -> Self {
		Self::Float(v)
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Self::String(v.to_string())
	}
}

impl From<String> for Value {
	fn from(v: String) -> Self {
		Self::String(v)
	}
}

impl From<Bytes> for Value {
	fn from(v: Bytes) -> Self {
		Self::Bytes(v)
	}
}

impl From<Vec<Value>> for Value {
	fn from(v: Vec<Value>) -> Self {
		Self::List(v)
	}
}

impl From<BTreeMap<String, Value>> for Value {
	fn from(v: BTreeMap<String, Value>) -> Self {
		Self::Map(v)
	}
}

impl From<ArrayValue> for Value {
	fn from(v: ArrayValue) -> Self {
		Self::Array(v)
	}
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Null => write!(f, "null"),
			Self::Bool(v) => write!(f, "{}", v),
			Self::Int(v) => write!(f, "{}", v),
			Self::Float(v) => write!(f, "{}", v),
			Self::String(v) => write!(f, "{:?}", v),
			Self::Bytes(v) => write!(f, "bytes[{}]", v.len()),
			Self::List(items) => {
				write!(f, "[")?;
				for (i, item) in items.iter().enumerate() {
					if i > 0 {
						write!(f, ", ")?;
					}
					write!(f, "{}", item)?;
				}
				write!(f, "]")
			}
			Self::Map(map) => {
				write!(f, "{{")?;
				for (i, (key, value)) in map.iter().enumerate() {
					if i > 0 {
						write!(f, ", ")?;
					}
					write!(f, "{:?}: {}", key, value)?;
				}
				write!(f, "}}")
			}
			Self::Array(array) => write!(f, "{}", array),
		}
	}
}

/// The element type of a numeric array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dtype {
	Uint8,
	Int8,
	Uint16,
	Int16,
	Uint32,
	Int32,
	Float32,
	Float64,
}

impl Dtype {
	/// The size of one element in bytes.
	pub const fn size(self) -> usize {
		match self {
			Self::Uint8 | Self::Int8 => 1,
			Self::Uint16 | Self::Int16 => 2,
			Self::Uint32 | Self::Int32 | Self::Float32 => 4,
			Self::Float64 => 8,
		}
	}

	/// The tag used on the wire.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Uint8 => "uint8",
			Self::Int8 => "int8",
			Self::Uint16 => "uint16",
			Self::Int16 => "int16",
			Self::Uint32 => "uint32",
			Self::Int32 => "int32",
			Self::Float32 => "float32",
			Self::Float64 => "float64",
		}
	}
}

impl FromStr for Dtype {
	type Err = DecodeError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"uint8" => Self::Uint8,
			"int8" => Self::Int8,
			"uint16" => Self::Uint16,
			"int16" => Self::Int16,
			"uint32" => Self::Uint32,
			"int32" => Self::Int32,
			"float32" => Self::Float32,
			"float64" => Self::Float64,
			other => return Err(DecodeError::UnknownDtype(other.to_string())),
		})
	}
}

impl fmt::Display for Dtype {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The array data length does not match the declared shape and dtype.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("array data is {actual} bytes, expected {expected}")]
pub struct ArrayShapeError {
	pub expected: usize,
	pub actual: usize,
}

/// A dense row-major numeric array, stored as raw little-endian bytes.
///
/// The invariant `data.len() == shape product * dtype size` holds for every
/// constructed value; both construction and decoding enforce it.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayValue {
	dtype: Dtype,
	shape: Vec<usize>,
	data: Bytes,
}

impl ArrayValue {
	pub fn new(dtype: Dtype, shape: Vec<usize>, data: impl Into<Bytes>) -> Result<Self, ArrayShapeError> {
		let data = data.into();
		let expected = shape
			.iter()
			.fold(dtype.size(), |product, dim| product.saturating_mul(*dim));

		if data.len() != expected {
			return Err(ArrayShapeError {
				expected,
				actual: data.len(),
			});
		}

		Ok(Self { dtype, shape, data })
	}

	/// Build a uint8 array from its elements.
	pub fn from_u8(shape: Vec<usize>, elements: Vec<u8>) -> Result<Self, ArrayShapeError> {
		Self::new(Dtype::Uint8, shape, elements)
	}

	/// Build a float32 array from its elements.
	pub fn from_f32(shape: Vec<usize>, elements: &[f32]) -> Result<Self, ArrayShapeError> {
		let mut data = Vec::with_capacity(elements.len() * 4);
		for v in elements {
			data.extend_from_slice(&v.to_le_bytes());
		}
		Self::new(Dtype::Float32, shape, data)
	}

	/// Build a float64 array from its elements.
	pub fn from_f64(shape: Vec<usize>, elements: &[f64]) -> Result<Self, ArrayShapeError> {
		let mut data = Vec::with_capacity(elements.len() * 8);
		for v in elements {
			data.extend_from_slice(&v.to_le_bytes());
		}
		Self::new(Dtype::Float64, shape, data)
	}

	pub fn dtype(&self) -> Dtype {
		self.dtype
	}

	pub fn shape(&self) -> &[usize] {
		&self.shape
	}

	/// Total number of elements.
	pub fn len(&self) -> usize {
		self.shape.iter().product()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// The raw little-endian element bytes, row-major.
	pub fn data(&self) -> &Bytes {
		&self.data
	}

	pub fn into_data(self) -> Bytes {
		self.data
	}
}

impl fmt::Display for ArrayValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "array(dtype={}, shape={:?})", self.dtype, self.shape)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn array_length_checked() {
		assert!(ArrayValue::new(Dtype::Uint8, vec![2, 3], vec![0u8; 6]).is_ok());
		assert!(ArrayValue::new(Dtype::Uint8, vec![2, 3], vec![0u8; 5]).is_err());
		assert!(ArrayValue::new(Dtype::Float32, vec![2], vec![0u8; 8]).is_ok());
		assert!(ArrayValue::new(Dtype::Float32, vec![2], vec![0u8; 6]).is_err());
	}

	#[test]
	fn array_zero_dim() {
		let scalar = ArrayValue::new(Dtype::Int16, vec![], vec![0u8; 2]).unwrap();
		assert_eq!(scalar.len(), 1);

		let empty = ArrayValue::new(Dtype::Int16, vec![0, 3], vec![]).unwrap();
		assert_eq!(empty.len(), 0);
		assert!(empty.is_empty());
	}

	#[test]
	fn dtype_tags_roundtrip() {
		for dtype in [
			Dtype::Uint8,
			Dtype::Int8,
			Dtype::Uint16,
			Dtype::Int16,
			Dtype::Uint32,
			Dtype::Int32,
			Dtype::Float32,
			Dtype::Float64,
		] {
			assert_eq!(dtype.as_str().parse::<Dtype>().unwrap(), dtype);
		}

		assert!(matches!(
			"complex128".parse::<Dtype>(),
			Err(DecodeError::UnknownDtype(_))
		));
	}

	#[test]
	fn display_is_compact() {
		let mut map = BTreeMap::new();
		map.insert("a".to_string(), Value::Int(1));
		map.insert("b".to_string(), Value::List(vec![Value::Int(2), Value::Bool(true)]));

		let value = Value::Map(map);
		assert_eq!(value.to_string(), r#"{"a": 1, "b": [2, true]}"#);
	}
}
