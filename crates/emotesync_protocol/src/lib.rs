#![forbid(unsafe_code)]

pub mod framing;
pub mod port;
pub mod upstream;

pub use framing::{DEFAULT_MAX_LINE_SIZE, FramingError, decode_line, encode_line};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}
