use crate::coding::{DecodeError, EncodeError};

/// Anything that can go wrong inside the fabric.
///
/// Background workers never surface these to the user thread; they log and
/// drop the offending message instead. Synchronous operations (construction,
/// explicit encode/decode) return them directly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("topic name must not be empty")]
	InvalidTopic,

	#[error("encode failed: {0}")]
	Encode(#[from] EncodeError),

	#[error("decode failed: {0}")]
	Decode(#[from] DecodeError),

	#[error("unsupported compression mode: {0:?}")]
	UnsupportedCompression(String),

	#[error("unsupported payload: expected {0}")]
	Payload(&'static str),

	#[error("image codec failed: {0}")]
	Image(#[from] image::ImageError),

	#[error("lz4 codec failed: {0}")]
	Lz4(#[from] lz4_flex::frame::Error),

	#[error("malformed frame: {0}")]
	Frame(&'static str),

	#[error("discovery failed: {0}")]
	Discovery(#[from] mdns_sd::Error),

	#[error("i/o failed: {0}")]
	Io(#[from] std::io::Error),
}
