//! Client-side WebSocket framing, RFC 6455.
//!
//! The framer owns three ring buffers: `buf_read` receives decrypted bytes
//! from the TLS layer, `buf_write` holds encoded frames waiting for TLS
//! egress, and `buf_to_mqtt` collects reassembled binary payloads for the
//! MQTT session.

use crate::buffer::RingBuffer;
use crate::session::Channel;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::cmp;

/// Magic GUID appended to the key when computing `Sec-WebSocket-Accept`.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the upgrade reply before we give up on finding its end.
const MAX_HANDSHAKE_REPLY: usize = 8 * 1024;

/// Largest header a broker-to-client frame can have: two fixed bytes plus an
/// eight-byte extended length. Server frames are never masked.
const MAX_SERVER_HEADER: usize = 10;

/// Header plus masking key overhead of a client frame with a 16-bit length.
const CLIENT_OVERHEAD_BASE: usize = 2 + 4;

const CONTROL_PAYLOAD_MAX: usize = 125;

#[derive(Debug, thiserror::Error)]
pub enum WsError {
	#[error("websocket handshake failed: {0}")]
	Handshake(&'static str),
	#[error("websocket protocol violation: {0}")]
	Protocol(&'static str),
}

impl WsError {
	pub fn reason(&self) -> &'static str {
		match self {
			Self::Handshake(reason) | Self::Protocol(reason) => reason,
		}
	}
}

/// Outcome of a [`WsClient::process`] pass.
#[derive(Debug, PartialEq, Eq)]
pub enum WsStatus {
	/// All buffered input was consumed or is waiting on downstream space.
	Idle,
	/// More bytes from the transport are required to make progress.
	NeedMoreBytes,
	/// The peer sent a close frame; no further data frames will be decoded.
	Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
	Continuation,
	Text,
	Binary,
	Close,
	Ping,
	Pong,
}

impl OpCode {
	fn is_control(self) -> bool {
		matches!(self, Self::Close | Self::Ping | Self::Pong)
	}

	fn wire(self) -> u8 {
		match self {
			Self::Continuation => 0x0,
			Self::Text => 0x1,
			Self::Binary => 0x2,
			Self::Close => 0x8,
			Self::Ping => 0x9,
			Self::Pong => 0xa,
		}
	}
}

impl TryFrom<u8> for OpCode {
	type Error = WsError;
	fn try_from(value: u8) -> Result<Self, WsError> {
		match value {
			0x0 => Ok(Self::Continuation),
			0x1 => Ok(Self::Text),
			0x2 => Ok(Self::Binary),
			0x8 => Ok(Self::Close),
			0x9 => Ok(Self::Ping),
			0xa => Ok(Self::Pong),
			_ => Err(WsError::Protocol("unknown frame opcode")),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WsState {
	Handshake,
	Established,
	Closing,
}

/// An inbound frame whose payload is still streaming out of `buf_read`.
#[derive(Debug)]
struct InboundFrame {
	opcode: OpCode,
	remaining: u64,
	/// Control frame payloads are small and buffered whole.
	control: Vec<u8>,
}

#[derive(Debug)]
pub struct WsClient {
	pub buf_read: RingBuffer,
	pub buf_write: RingBuffer,
	pub buf_to_mqtt: RingBuffer,

	state: WsState,
	accept_key: String,
	current: Option<InboundFrame>,
	/// Set while a fragmented binary message is open.
	fragmented: bool,
	close_sent: bool,
}

impl WsClient {
	pub fn new(buffer_size: usize) -> Self {
		Self {
			buf_read: RingBuffer::with_capacity(buffer_size),
			buf_write: RingBuffer::with_capacity(buffer_size),
			buf_to_mqtt: RingBuffer::with_capacity(buffer_size),
			state: WsState::Handshake,
			accept_key: String::new(),
			current: None,
			fragmented: false,
			close_sent: false,
		}
	}

	/// Clears all buffers and framing state ahead of a (re)connect.
	pub fn reset(&mut self) {
		self.buf_read.clear();
		self.buf_write.clear();
		self.buf_to_mqtt.clear();
		self.state = WsState::Handshake;
		self.accept_key.clear();
		self.current = None;
		self.fragmented = false;
		self.close_sent = false;
	}

	pub fn is_established(&self) -> bool {
		self.state == WsState::Established
	}

	#[cfg(test)]
	pub(crate) fn force_established(&mut self) {
		self.state = WsState::Established;
	}

	/// Queues the HTTP upgrade request and records the accept key the reply
	/// must echo.
	pub fn start_handshake(&mut self, host: &str, port: u16, path: &str) -> Result<(), WsError> {
		let key = BASE64.encode(rand::random::<[u8; 16]>());
		self.accept_key = compute_accept_key(&key);

		let request = format!(
			"GET {path} HTTP/1.1\r\n\
			 Host: {host}:{port}\r\n\
			 Upgrade: websocket\r\n\
			 Connection: Upgrade\r\n\
			 Sec-WebSocket-Key: {key}\r\n\
			 Sec-WebSocket-Version: 13\r\n\
			 Sec-WebSocket-Protocol: mqtt\r\n\
			 \r\n"
		);

		if self.buf_write.push(request.as_bytes()) != request.len() {
			return Err(WsError::Handshake("no space for the upgrade request"));
		}

		self.state = WsState::Handshake;
		Ok(())
	}

	/// Drives the framer over whatever `buf_read` currently holds.
	pub fn process(&mut self) -> Result<WsStatus, WsError> {
		if self.state == WsState::Handshake {
			if !self.process_handshake()? {
				return Ok(WsStatus::NeedMoreBytes);
			}
			tracing::debug!("websocket handshake complete");
		}

		loop {
			if let Some(status) = self.pump_current()? {
				return Ok(status);
			}

			if self.state == WsState::Closing {
				return Ok(WsStatus::Closed);
			}

			// Decode the next frame header.
			let mut header = [0u8; MAX_SERVER_HEADER];
			let buffered = self.buf_read.peek(&mut header);
			if buffered < 2 {
				return Ok(WsStatus::NeedMoreBytes);
			}

			if header[0] & 0x70 != 0 {
				return Err(WsError::Protocol("reserved bits must be zero"));
			}
			if header[1] & 0x80 != 0 {
				return Err(WsError::Protocol("server frames must not be masked"));
			}

			let fin = header[0] & 0x80 != 0;
			let opcode = OpCode::try_from(header[0] & 0x0f)?;

			let (header_len, payload_len) = match header[1] & 0x7f {
				126 => {
					if buffered < 4 {
						return Ok(WsStatus::NeedMoreBytes);
					}
					(4, u64::from(u16::from_be_bytes([header[2], header[3]])))
				}
				127 => {
					if buffered < 10 {
						return Ok(WsStatus::NeedMoreBytes);
					}
					let mut len = [0u8; 8];
					len.copy_from_slice(&header[2..10]);
					let len = u64::from_be_bytes(len);
					if len & (1 << 63) != 0 {
						return Err(WsError::Protocol("payload length high bit set"));
					}
					(10, len)
				}
				len => (2, u64::from(len)),
			};

			self.check_frame(opcode, fin, payload_len)?;
			self.buf_read.skip(header_len);
			self.current = Some(InboundFrame {
				opcode,
				remaining: payload_len,
				control: Vec::new(),
			});
		}
	}

	/// Validates a frame header against the framing state.
	fn check_frame(&mut self, opcode: OpCode, fin: bool, payload_len: u64) -> Result<(), WsError> {
		if opcode.is_control() {
			if !fin {
				return Err(WsError::Protocol("control frames must not be fragmented"));
			}
			if payload_len > CONTROL_PAYLOAD_MAX as u64 {
				return Err(WsError::Protocol("control frame payload too large"));
			}
			return Ok(());
		}

		match opcode {
			OpCode::Text => Err(WsError::Protocol("unexpected text frame")),
			OpCode::Binary => {
				if self.fragmented {
					return Err(WsError::Protocol("interleaved data frame"));
				}
				self.fragmented = !fin;
				Ok(())
			}
			OpCode::Continuation => {
				if !self.fragmented {
					return Err(WsError::Protocol("continuation without an open message"));
				}
				self.fragmented = !fin;
				Ok(())
			}
			_ => unreachable!(),
		}
	}

	/// Streams payload bytes of the frame in flight. Returns `Some(status)`
	/// when the pass must stop, `None` when the frame completed.
	fn pump_current(&mut self) -> Result<Option<WsStatus>, WsError> {
		let Some(frame) = self.current.as_mut() else {
			return Ok(None);
		};

		while frame.remaining > 0 {
			let span = self.buf_read.read_range();
			if span.is_empty() {
				return Ok(Some(WsStatus::NeedMoreBytes));
			}

			let take = cmp::min(span.len() as u64, frame.remaining) as usize;
			if frame.opcode.is_control() {
				frame.control.extend_from_slice(&span[..take]);
				self.buf_read.skip(take);
				frame.remaining -= take as u64;
			} else {
				let moved = self.buf_to_mqtt.push(&span[..take]);
				if moved == 0 {
					// Reassembly buffer is full; wait for the session to
					// drain it.
					return Ok(Some(WsStatus::Idle));
				}
				self.buf_read.skip(moved);
				frame.remaining -= moved as u64;
			}
		}

		let frame = self.current.take().unwrap();
		if frame.opcode.is_control() {
			self.finish_control(frame)?;
		}
		Ok(None)
	}

	fn finish_control(&mut self, frame: InboundFrame) -> Result<(), WsError> {
		match frame.opcode {
			OpCode::Ping => {
				if self.send(OpCode::Pong, &frame.control) != frame.control.len() {
					tracing::warn!("dropping pong reply, write buffer is full");
				}
			}
			OpCode::Pong => {
				tracing::trace!("pong received");
			}
			OpCode::Close => {
				let code = match frame.control.get(..2) {
					Some(bytes) => u16::from_be_bytes([bytes[0], bytes[1]]),
					None => 1005,
				};
				tracing::info!(code, "close frame received");
				if !self.close_sent {
					self.send(OpCode::Close, &frame.control);
				}
				self.state = WsState::Closing;
			}
			_ => unreachable!(),
		}
		Ok(())
	}

	/// Encodes `payload` into a single masked frame, taking as much as fits
	/// into `buf_write`. Returns the number of payload bytes accepted.
	///
	/// Data frames may be split across calls; the byte stream is what
	/// matters to the receiver. Control frames are all-or-nothing.
	pub fn send(&mut self, opcode: OpCode, payload: &[u8]) -> usize {
		if self.state == WsState::Handshake {
			return 0;
		}

		let free = self.buf_write.available();
		if free < CLIENT_OVERHEAD_BASE {
			return 0;
		}
		let mut accept = cmp::min(payload.len(), free.saturating_sub(CLIENT_OVERHEAD_BASE));
		while accept > 0 && frame_overhead(accept) + accept > free {
			accept = free - frame_overhead(accept);
		}

		if opcode.is_control() && accept < payload.len() {
			return 0;
		}
		if accept == 0 && !payload.is_empty() {
			return 0;
		}

		let mask: [u8; 4] = rand::random();
		let mut header = [0u8; 14];
		let mut header_len = 2;
		header[0] = 0x80 | opcode.wire();
		if accept > u16::MAX as usize {
			header[1] = 0x80 | 127;
			header[2..10].copy_from_slice(&(accept as u64).to_be_bytes());
			header_len = 10;
		} else if accept > CONTROL_PAYLOAD_MAX {
			header[1] = 0x80 | 126;
			header[2..4].copy_from_slice(&(accept as u16).to_be_bytes());
			header_len = 4;
		} else {
			header[1] = 0x80 | accept as u8;
		}
		header[header_len..header_len + 4].copy_from_slice(&mask);
		header_len += 4;

		let pushed = self.buf_write.push(&header[..header_len]);
		debug_assert_eq!(pushed, header_len);

		let mut scratch = [0u8; 1024];
		let mut offset = 0;
		while offset < accept {
			let step = cmp::min(scratch.len(), accept - offset);
			for i in 0..step {
				scratch[i] = payload[offset + i] ^ mask[(offset + i) % 4];
			}
			let pushed = self.buf_write.push(&scratch[..step]);
			debug_assert_eq!(pushed, step);
			offset += step;
		}

		if opcode == OpCode::Close {
			self.close_sent = true;
		}

		accept
	}

	/// Parses the HTTP upgrade reply. Returns `true` once complete.
	fn process_handshake(&mut self) -> Result<bool, WsError> {
		let consumed = {
			let span = self.buf_read.read_range();
			let Some(end) = span.windows(4).position(|w| w == b"\r\n\r\n") else {
				if self.buf_read.len() >= MAX_HANDSHAKE_REPLY {
					return Err(WsError::Handshake("upgrade reply too large"));
				}
				return Ok(false);
			};

			let head = std::str::from_utf8(&span[..end])
				.map_err(|_| WsError::Handshake("upgrade reply is not valid utf-8"))?;

			let mut lines = head.lines();
			let status = lines
				.next()
				.ok_or(WsError::Handshake("empty upgrade reply"))?;
			let code = status
				.split_whitespace()
				.nth(1)
				.ok_or(WsError::Handshake("malformed status line"))?;
			if code != "101" {
				tracing::error!(status, "websocket upgrade rejected");
				return Err(WsError::Handshake("server refused the upgrade"));
			}

			let mut upgrade_ok = false;
			let mut connection_ok = false;
			let mut accept: Option<&str> = None;
			for line in lines {
				let Some((name, value)) = line.split_once(':') else {
					continue;
				};
				let value = value.trim();
				match name.trim().to_ascii_lowercase().as_str() {
					"upgrade" => upgrade_ok = value.eq_ignore_ascii_case("websocket"),
					"connection" => {
						connection_ok = value.to_ascii_lowercase().contains("upgrade")
					}
					"sec-websocket-accept" => accept = Some(value),
					_ => {}
				}
			}

			if !upgrade_ok || !connection_ok {
				return Err(WsError::Handshake("reply is not a websocket upgrade"));
			}
			if accept != Some(self.accept_key.as_str()) {
				return Err(WsError::Handshake("Sec-WebSocket-Accept mismatch"));
			}

			end + 4
		};

		self.buf_read.skip(consumed);
		self.state = WsState::Established;
		Ok(true)
	}
}

/// Bytes of framing around a client payload of `len` bytes.
fn frame_overhead(len: usize) -> usize {
	CLIENT_OVERHEAD_BASE
		+ if len > u16::MAX as usize {
			8
		} else if len > CONTROL_PAYLOAD_MAX {
			2
		} else {
			0
		}
}

/// `Sec-WebSocket-Accept` derivation from the request key.
fn compute_accept_key(key: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(key.as_bytes());
	hasher.update(WS_GUID.as_bytes());
	BASE64.encode(hasher.finalize())
}

impl Channel for WsClient {
	fn send(&mut self, buf: &[u8]) -> usize {
		WsClient::send(self, OpCode::Binary, buf)
	}

	fn recv(&mut self, buf: &mut [u8]) -> usize {
		self.buf_to_mqtt.pop(buf)
	}
}
