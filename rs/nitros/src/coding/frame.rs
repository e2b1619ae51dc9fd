use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::Error;

/// The payload codec, selected by the low two bits of payload byte 0.
///
/// The upper six bits are reserved and must be zero; receivers reject frames
/// that set them, so future codecs can claim them safely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Flags {
	Structured = 0,
	Image = 1,
	Pointcloud = 2,
}

impl Flags {
	const RESERVED: u8 = !0x03;

	/// Parse payload byte 0.
	pub fn parse(byte: u8) -> Result<Self, Error> {
		if byte & Self::RESERVED != 0 {
			return Err(Error::Frame("reserved flag bits set"));
		}

		Self::try_from(byte & 0x03).map_err(|_| Error::Frame("reserved codec value"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_known_codecs() {
		assert_eq!(Flags::parse(0).unwrap(), Flags::Structured);
		assert_eq!(Flags::parse(1).unwrap(), Flags::Image);
		assert_eq!(Flags::parse(2).unwrap(), Flags::Pointcloud);
	}

	#[test]
	fn rejects_reserved() {
		assert!(Flags::parse(3).is_err());
		assert!(Flags::parse(0x04).is_err());
		assert!(Flags::parse(0x80).is_err());
		assert!(Flags::parse(0x81).is_err());
	}
}
