#![forbid(unsafe_code)]

//! Newline-delimited JSON framing for the client-facing port transport.

use thiserror::Error;

use crate::port::PortMessage;

/// Default maximum encoded line size for v1.
pub const DEFAULT_MAX_LINE_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("line exceeds maximum size: len={len} max={max}")]
	LineTooLarge {
		len: usize,
		max: usize,
	},

	#[error("empty line")]
	EmptyLine,

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Encode a port message as a single JSON line (terminator included).
pub fn encode_line(msg: &PortMessage, max_line_size: usize) -> Result<String, FramingError> {
	let mut line = serde_json::to_string(msg)?;
	if line.len() >= max_line_size {
		return Err(FramingError::LineTooLarge {
			len: line.len(),
			max: max_line_size,
		});
	}
	line.push('\n');
	Ok(line)
}

/// Decode one line (without the terminator) into a port message.
pub fn decode_line(line: &str, max_line_size: usize) -> Result<PortMessage, FramingError> {
	let line = line.trim_end_matches(['\r', '\n']);
	if line.is_empty() {
		return Err(FramingError::EmptyLine);
	}
	if line.len() > max_line_size {
		return Err(FramingError::LineTooLarge {
			len: line.len(),
			max: max_line_size,
		});
	}
	Ok(serde_json::from_str(line)?)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::port::{LogLevel, StateUpdate};

	#[test]
	fn encoded_line_is_single_line() {
		let msg = PortMessage::Log {
			level: LogLevel::Warn,
			message: "subscription rejected".to_string(),
		};
		let line = encode_line(&msg, DEFAULT_MAX_LINE_SIZE).unwrap();
		assert!(line.ends_with('\n'));
		assert_eq!(line.matches('\n').count(), 1);
	}

	#[test]
	fn rejects_oversized_line() {
		let msg = PortMessage::Log {
			level: LogLevel::Info,
			message: "x".repeat(256),
		};
		let err = encode_line(&msg, 64).unwrap_err();
		match err {
			FramingError::LineTooLarge { len, max } => {
				assert!(len > max);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn decode_tolerates_crlf() {
		let msg = PortMessage::State {
			state: StateUpdate::default(),
		};
		let mut line = encode_line(&msg, DEFAULT_MAX_LINE_SIZE).unwrap();
		line.insert(line.len() - 1, '\r');
		let back = decode_line(&line, DEFAULT_MAX_LINE_SIZE).unwrap();
		assert_eq!(back, msg);
	}

	#[test]
	fn decode_rejects_empty() {
		assert!(matches!(decode_line("\n", DEFAULT_MAX_LINE_SIZE), Err(FramingError::EmptyLine)));
	}
}
