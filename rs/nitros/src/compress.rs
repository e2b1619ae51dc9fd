//! Lossy payload codecs for camera-like and point-cloud-like bulk data.
//!
//! Both codecs are opaque byte-to-byte transforms selected per topic: every
//! message on a compressed topic uses the same mode for its whole lifetime.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageFormat};

use crate::coding::{ArrayValue, DecodeError, Dtype, Flags, Value};
use crate::Error;

// JPEG quality for image topics.
const JPEG_QUALITY: u8 = 80;

// Pointcloud values are quantized to millimeters before compression.
const QUANT_SCALE: f64 = 1000.0;

/// The per-topic compression mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
	/// 2D or 3D uint8 arrays as JPEG.
	Image,
	/// Floating-point arrays in meters, quantized to 1 mm and LZ4-framed.
	Pointcloud,
}

impl Compression {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Image => "image",
			Self::Pointcloud => "pointcloud",
		}
	}

	/// The flags byte announcing this codec on the wire.
	pub(crate) const fn flags(self) -> Flags {
		match self {
			Self::Image => Flags::Image,
			Self::Pointcloud => Flags::Pointcloud,
		}
	}

	/// The discovery TXT label; the empty string means uncompressed.
	pub fn label(mode: Option<Compression>) -> &'static str {
		match mode {
			Some(mode) => mode.as_str(),
			None => "",
		}
	}

	/// Parse a discovery TXT label. Unknown labels fail construction.
	pub fn from_label(label: &str) -> Result<Option<Compression>, Error> {
		match label {
			"" => Ok(None),
			"image" => Ok(Some(Self::Image)),
			"pointcloud" => Ok(Some(Self::Pointcloud)),
			other => Err(Error::UnsupportedCompression(other.to_string())),
		}
	}
}

impl FromStr for Compression {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match Self::from_label(s)? {
			Some(mode) => Ok(mode),
			None => Err(Error::UnsupportedCompression(s.to_string())),
		}
	}
}

impl fmt::Display for Compression {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Compress an array with the given mode.
pub fn compress(value: &Value, mode: Compression) -> Result<Vec<u8>, Error> {
	let array = match value {
		Value::Array(array) => array,
		_ => return Err(Error::Payload("a numeric array")),
	};

	match mode {
		Compression::Image => compress_image(array),
		Compression::Pointcloud => compress_pointcloud(array),
	}
}

/// Decompress a payload body with the given mode.
pub fn decompress(data: &[u8], mode: Compression) -> Result<Value, Error> {
	let array = match mode {
		Compression::Image => decompress_image(data)?,
		Compression::Pointcloud => decompress_pointcloud(data)?,
	};

	Ok(Value::Array(array))
}

fn compress_image(array: &ArrayValue) -> Result<Vec<u8>, Error> {
	if array.dtype() != Dtype::Uint8 {
		return Err(Error::Payload("a uint8 array"));
	}

	let (height, width, color) = match *array.shape() {
		[h, w] | [h, w, 1] => (h, w, ExtendedColorType::L8),
		[h, w, 3] => (h, w, ExtendedColorType::Rgb8),
		_ => return Err(Error::Payload("an HxW or HxWx3 array")),
	};

	let mut out = Vec::new();
	let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
	encoder.encode(array.data(), width as u32, height as u32, color)?;
	Ok(out)
}

fn decompress_image(data: &[u8]) -> Result<ArrayValue, Error> {
	let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)?;

	let (shape, raw) = match image {
		DynamicImage::ImageLuma8(gray) => {
			let (width, height) = gray.dimensions();
			(vec![height as usize, width as usize], gray.into_raw())
		}
		other => {
			let rgb = other.to_rgb8();
			let (width, height) = rgb.dimensions();
			(vec![height as usize, width as usize, 3], rgb.into_raw())
		}
	};

	Ok(ArrayValue::from_u8(shape, raw).map_err(DecodeError::ArrayShapeMismatch)?)
}

// Wire layout: [u32 BE shape byte length][i32 BE per dimension][LZ4 frame of
// the quantized i16 body, little-endian, row-major].
fn compress_pointcloud(array: &ArrayValue) -> Result<Vec<u8>, Error> {
	let mut body = Vec::with_capacity(array.len() * 2);
	for meters in iter_float(array)? {
		let quantized = (meters * QUANT_SCALE).round();
		let quantized = quantized.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
		body.extend_from_slice(&quantized.to_le_bytes());
	}

	let mut out = Vec::with_capacity(body.len() / 2 + 16);
	out.extend_from_slice(&((array.shape().len() * 4) as u32).to_be_bytes());
	for dim in array.shape() {
		out.extend_from_slice(&(*dim as i32).to_be_bytes());
	}

	let mut encoder = lz4_flex::frame::FrameEncoder::new(out);
	encoder.write_all(&body).map_err(Error::Io)?;
	Ok(encoder.finish()?)
}

fn decompress_pointcloud(data: &[u8]) -> Result<ArrayValue, Error> {
	if data.len() < 4 {
		return Err(DecodeError::Malformed("truncated pointcloud header").into());
	}

	let shape_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
	if shape_len % 4 != 0 || data.len() < 4 + shape_len {
		return Err(DecodeError::Malformed("truncated pointcloud shape").into());
	}

	let mut shape = Vec::with_capacity(shape_len / 4);
	for dim in data[4..4 + shape_len].chunks_exact(4) {
		let dim = i32::from_be_bytes([dim[0], dim[1], dim[2], dim[3]]);
		if dim < 0 {
			return Err(DecodeError::Malformed("negative pointcloud dimension").into());
		}
		shape.push(dim as usize);
	}

	let mut body = Vec::new();
	let mut decoder = lz4_flex::frame::FrameDecoder::new(&data[4 + shape_len..]);
	decoder.read_to_end(&mut body).map_err(Error::Io)?;

	let mut elements = Vec::with_capacity(body.len() / 2 * 4);
	for quantized in body.chunks_exact(2) {
		let meters = i16::from_le_bytes([quantized[0], quantized[1]]) as f32 / QUANT_SCALE as f32;
		elements.extend_from_slice(&meters.to_le_bytes());
	}

	Ok(ArrayValue::new(Dtype::Float32, shape, elements).map_err(DecodeError::ArrayShapeMismatch)?)
}

// Row-major f64 view over a float array, whatever its precision.
fn iter_float<'a>(array: &'a ArrayValue) -> Result<Box<dyn Iterator<Item = f64> + 'a>, Error> {
	let data = array.data();
	match array.dtype() {
		Dtype::Float32 => Ok(Box::new(
			data.chunks_exact(4)
				.map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64),
		)),
		Dtype::Float64 => Ok(Box::new(data.chunks_exact(8).map(|b| {
			f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
		}))),
		_ => Err(Error::Payload("a float32 or float64 array")),
	}
}
