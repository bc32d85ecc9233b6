//! MQTT v3.1.1 packet types and wire codec.
//!
//! Only the client side of the exchange is implemented: the serializers
//! cover packets a client sends, the parsers cover packets a broker sends.

use crate::PacketId;
use bytes::{BufMut, Bytes, BytesMut};
use std::{fmt, str::Utf8Error};

/// The only valid protocol name for MQTT v3.1.1.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT v3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Quality of Service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QoS {
	#[default]
	AtMostOnce = 0,
	AtLeastOnce,
	ExactlyOnce,
}

#[derive(Debug)]
pub struct InvalidQoS;

impl TryFrom<u8> for QoS {
	type Error = InvalidQoS;
	#[inline]
	fn try_from(value: u8) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::AtMostOnce),
			1 => Ok(Self::AtLeastOnce),
			2 => Ok(Self::ExactlyOnce),
			_ => Err(InvalidQoS),
		}
	}
}

/// CONNACK return codes, with the reason phrasing used in log output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectReturnCode {
	Accepted,
	BadProtocolVersion,
	IdentifierRejected,
	ServerUnavailable,
	BadCredentials,
	NotAuthorized,
	Unknown(u8),
}

impl From<u8> for ConnectReturnCode {
	fn from(code: u8) -> Self {
		match code {
			0 => Self::Accepted,
			1 => Self::BadProtocolVersion,
			2 => Self::IdentifierRejected,
			3 => Self::ServerUnavailable,
			4 => Self::BadCredentials,
			5 => Self::NotAuthorized,
			other => Self::Unknown(other),
		}
	}
}

impl fmt::Display for ConnectReturnCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Accepted => write!(f, "connection accepted"),
			Self::BadProtocolVersion => write!(f, "unsupported protocol version"),
			Self::IdentifierRejected => write!(f, "client identifier rejected by the server"),
			Self::ServerUnavailable => write!(f, "mqtt service unavailable"),
			Self::BadCredentials => write!(f, "malformed user name or password"),
			Self::NotAuthorized => write!(f, "client is not authorized to connect"),
			Self::Unknown(code) => write!(f, "unknown return code {code}"),
		}
	}
}

//
// Serialization
//

/// The destination buffer cannot hold the encoded packet, or a field
/// exceeded its wire-format limit.
#[derive(Debug)]
pub struct SerializeError;

/// Write half of the codec. Failure latches: once a field does not fit,
/// every later write is skipped and [`finish`] reports the error, so the
/// encoders can chain fields without per-call plumbing.
///
/// [`finish`]: PacketWriter::finish
struct PacketWriter<'a, B> {
	dst: &'a mut B,
	ok: bool,
}

impl<'a, B: BufMut> PacketWriter<'a, B> {
	fn new(dst: &'a mut B) -> Self {
		Self { dst, ok: true }
	}

	fn bytes(&mut self, value: &[u8]) -> &mut Self {
		if self.ok {
			if self.dst.remaining_mut() >= value.len() {
				self.dst.put_slice(value);
			} else {
				self.ok = false;
			}
		}
		self
	}

	fn u8(&mut self, value: u8) -> &mut Self {
		self.bytes(&[value])
	}

	fn u16(&mut self, value: u16) -> &mut Self {
		self.bytes(&value.to_be_bytes())
	}

	/// A length-prefixed binary field. The prefix is 16 bits, which caps
	/// the field at 65535 bytes.
	fn blob(&mut self, value: &[u8]) -> &mut Self {
		if value.len() > u16::MAX as usize {
			self.ok = false;
			return self;
		}
		self.u16(value.len() as u16).bytes(value)
	}

	fn utf8(&mut self, value: &str) -> &mut Self {
		self.blob(value.as_bytes())
	}

	/// The fixed header's remaining-length field: seven bits per byte,
	/// continuation in the top bit, at most four bytes.
	fn remaining_len(&mut self, mut value: usize) -> &mut Self {
		if value > MAX_REMAINING_LENGTH {
			self.ok = false;
			return self;
		}

		let mut field = [0u8; 4];
		let mut used = 0;
		loop {
			field[used] = (value & 0x7f) as u8;
			value >>= 7;
			if value == 0 {
				break;
			}
			field[used] |= 0x80;
			used += 1;
		}
		self.bytes(&field[..=used])
	}

	fn finish(&self) -> Result<(), SerializeError> {
		if self.ok {
			Ok(())
		} else {
			Err(SerializeError)
		}
	}
}

pub trait EncodePacket {
	fn encode(&self, dst: &mut impl BufMut) -> Result<(), SerializeError>;
}

//
// Parsing
//

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
	#[error("packet is incomplete")]
	Incomplete,
	#[error("invalid qos value")]
	InvalidQoS,
	#[error("invalid packet header {0:#04x}")]
	InvalidHeader(u8),
	#[error("packet id must be non-zero")]
	ZeroPacketId,
	#[error("malformed remaining length")]
	MalformedLength,
	#[error("{0}")]
	MalformedPacket(&'static str),
	#[error("string is not valid utf-8")]
	Utf8(#[from] Utf8Error),
}

impl From<InvalidQoS> for ParseError {
	#[inline]
	fn from(_: InvalidQoS) -> Self {
		Self::InvalidQoS
	}
}

/// Borrowing byte scanner used by the packet parsers.
#[derive(Debug)]
pub struct Scanner<'b> {
	pos: usize,
	buf: &'b [u8],
}

impl<'b> Scanner<'b> {
	pub fn new(buf: &'b [u8]) -> Self {
		Self { pos: 0, buf }
	}

	fn require(&self, amount: usize) -> Result<(), ParseError> {
		if self.buf.len() >= self.pos + amount {
			Ok(())
		} else {
			Err(ParseError::Incomplete)
		}
	}

	pub fn remaining(&self) -> usize {
		self.buf.len() - self.pos
	}

	pub fn has_remaining(&self) -> bool {
		self.remaining() > 0
	}

	pub fn take_slice(&mut self, len: usize) -> Result<&'b [u8], ParseError> {
		self.require(len)?;
		let start = self.pos;
		self.pos += len;
		Ok(&self.buf[start..self.pos])
	}

	pub fn take_rest(&mut self) -> &'b [u8] {
		let start = self.pos;
		self.pos = self.buf.len();
		&self.buf[start..]
	}

	pub fn take_u8(&mut self) -> Result<u8, ParseError> {
		Ok(self.take_slice(1)?[0])
	}

	pub fn take_u16(&mut self) -> Result<u16, ParseError> {
		let slice = self.take_slice(2)?;
		Ok(u16::from_be_bytes([slice[0], slice[1]]))
	}

	pub fn take_str(&mut self) -> Result<&'b str, ParseError> {
		let len = self.take_u16()?;
		let slice = self.take_slice(len.into())?;
		Ok(std::str::from_utf8(slice)?)
	}

	pub fn take_id(&mut self) -> Result<PacketId, ParseError> {
		let id = self.take_u16()?;
		PacketId::new(id).ok_or(ParseError::ZeroPacketId)
	}
}

/// A complete packet frame: the fixed header byte plus the variable part.
#[derive(Debug)]
pub struct Frame {
	pub header: u8,
	pub payload: Bytes,
}

impl Frame {
	/// Splits the leading frame off `buffer` once the whole packet has
	/// arrived. `Ok(None)` leaves a partial packet untouched for the next
	/// read to extend.
	pub fn split_from(buffer: &mut BytesMut) -> Result<Option<Self>, ParseError> {
		let Some(&header) = buffer.first() else {
			return Ok(None);
		};
		// Packet types 0 and 15 are reserved.
		if header >> 4 == 0 || header >> 4 == 15 {
			return Err(ParseError::InvalidHeader(header));
		}

		// Remaining length: seven bits per byte, continuation in the top
		// bit, at most four bytes.
		let mut length = 0usize;
		let mut offset = 1;
		loop {
			let Some(&byte) = buffer.get(offset) else {
				return Ok(None);
			};
			length |= usize::from(byte & 0x7f) << (7 * (offset - 1));
			offset += 1;
			if byte & 0x80 == 0 {
				break;
			}
			if offset > 4 {
				return Err(ParseError::MalformedLength);
			}
		}

		if buffer.len() < offset + length {
			return Ok(None);
		}

		let payload = buffer.split_to(offset + length).freeze().slice(offset..);
		Ok(Some(Self { header, payload }))
	}
}

//
// Packet types
//

/// Initiates the MQTT session. Client to broker only.
#[derive(Debug)]
pub struct Connect<'a> {
	pub client_id: &'a str,
	pub keep_alive: u16,
	pub clean_session: bool,
	pub will: Option<WillRef<'a>>,
	pub credentials: Option<Credentials<'a>>,
}

#[derive(Debug)]
pub struct WillRef<'a> {
	pub topic: &'a str,
	pub payload: &'a [u8],
	pub qos: QoS,
	pub retain: bool,
}

#[derive(Debug)]
pub struct Credentials<'a> {
	pub username: &'a str,
	pub password: Option<&'a str>,
}

impl Connect<'_> {
	fn flags(&self) -> u8 {
		let mut flags = 0;

		if self.clean_session {
			flags |= 0x02;
		}

		if let Some(will) = &self.will {
			flags |= 0x04;
			flags |= (will.qos as u8) << 3;
			if will.retain {
				flags |= 0x20;
			}
		}

		if let Some(credentials) = &self.credentials {
			flags |= 0x80;
			if credentials.password.is_some() {
				flags |= 0x40;
			}
		}

		flags
	}

	fn payload_len(&self) -> usize {
		let mut len = 2 + PROTOCOL_NAME.len() + 4 + (2 + self.client_id.len());

		if let Some(will) = &self.will {
			len += 2 + will.topic.len() + 2 + will.payload.len();
		}

		if let Some(credentials) = &self.credentials {
			len += 2 + credentials.username.len();
			if let Some(password) = &credentials.password {
				len += 2 + password.len();
			}
		}

		len
	}
}

impl EncodePacket for Connect<'_> {
	fn encode(&self, dst: &mut impl BufMut) -> Result<(), SerializeError> {
		let mut writer = PacketWriter::new(dst);
		writer
			.u8(0x10)
			.remaining_len(self.payload_len())
			.utf8(PROTOCOL_NAME)
			.u8(PROTOCOL_LEVEL)
			.u8(self.flags())
			.u16(self.keep_alive)
			.utf8(self.client_id);

		if let Some(will) = &self.will {
			writer.utf8(will.topic).blob(will.payload);
		}

		if let Some(credentials) = &self.credentials {
			writer.utf8(credentials.username);
			if let Some(password) = &credentials.password {
				writer.utf8(password);
			}
		}

		writer.finish()
	}
}

/// Acknowledges the CONNECT. Broker to client only.
#[derive(Debug)]
pub struct ConnAck {
	pub session_present: bool,
	pub code: ConnectReturnCode,
}

impl ConnAck {
	pub fn parse(frame: &Frame) -> Result<Self, ParseError> {
		let mut scanner = Scanner::new(&frame.payload[..]);

		if scanner.remaining() != 2 {
			return Err(ParseError::MalformedPacket("ConnAck must have length 2"));
		}

		let flags = scanner.take_u8()?;
		let code = scanner.take_u8()?;

		if flags & 0xfe != 0 {
			return Err(ParseError::MalformedPacket(
				"upper 7 bits of ConnAck flags must be zero",
			));
		}

		Ok(Self {
			session_present: flags & 0x01 == 0x01,
			code: code.into(),
		})
	}
}

const PUBLISH_HEADER_CONTROL: u8 = 0x30;
const PUBLISH_HEADER_RETAIN_FLAG: u8 = 0x01;
const PUBLISH_HEADER_DUPLICATE_FLAG: u8 = 0x08;
const PUBLISH_HEADER_QOS_MASK: u8 = 0x06;

/// An application message, flowing in either direction.
///
/// `id` is `Some` exactly when `qos` is above [`QoS::AtMostOnce`].
pub struct Publish<'a> {
	pub id: Option<PacketId>,
	pub qos: QoS,
	pub retain: bool,
	pub duplicate: bool,
	pub topic: &'a str,
	pub payload: &'a [u8],
}

impl<'a> Publish<'a> {
	pub fn parse(frame: &'a Frame) -> Result<Self, ParseError> {
		let flags = frame.header & 0x0f;
		let retain = flags & PUBLISH_HEADER_RETAIN_FLAG != 0;
		let duplicate = flags & PUBLISH_HEADER_DUPLICATE_FLAG != 0;
		let qos: QoS = ((flags & PUBLISH_HEADER_QOS_MASK) >> 1).try_into()?;

		let mut scanner = Scanner::new(&frame.payload[..]);
		let topic = scanner.take_str()?;

		let id = match qos {
			QoS::AtMostOnce => {
				if duplicate {
					return Err(ParseError::MalformedPacket(
						"duplicate flag must be 0 for qos 0 Publish",
					));
				}
				None
			}
			QoS::AtLeastOnce | QoS::ExactlyOnce => Some(scanner.take_id()?),
		};

		Ok(Self {
			id,
			qos,
			retain,
			duplicate,
			topic,
			payload: scanner.take_rest(),
		})
	}
}

impl EncodePacket for Publish<'_> {
	fn encode(&self, dst: &mut impl BufMut) -> Result<(), SerializeError> {
		let mut flags = (self.qos as u8) << 1;
		if self.retain {
			flags |= PUBLISH_HEADER_RETAIN_FLAG;
		}
		if self.duplicate {
			flags |= PUBLISH_HEADER_DUPLICATE_FLAG;
		}

		let id_len = if self.id.is_some() { 2 } else { 0 };
		let mut writer = PacketWriter::new(dst);
		writer
			.u8(PUBLISH_HEADER_CONTROL | flags)
			.remaining_len(2 + self.topic.len() + id_len + self.payload.len())
			.utf8(self.topic);
		if let Some(id) = self.id {
			writer.u16(id.get());
		}
		writer.bytes(self.payload);
		writer.finish()
	}
}

impl fmt::Debug for Publish<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Publish")
			.field("id", &self.id)
			.field("qos", &self.qos)
			.field("retain", &self.retain)
			.field("duplicate", &self.duplicate)
			.field("topic", &self.topic)
			.field("payload length", &self.payload.len())
			.finish()
	}
}

/// Requests one or more subscriptions. Client to broker only.
#[derive(Debug)]
pub struct Subscribe<'a> {
	pub id: PacketId,
	pub filters: &'a [(&'a str, QoS)],
}

impl EncodePacket for Subscribe<'_> {
	fn encode(&self, dst: &mut impl BufMut) -> Result<(), SerializeError> {
		let len = 2 + self
			.filters
			.iter()
			.fold(0usize, |acc, (filter, _)| acc + 3 + filter.len());

		let mut writer = PacketWriter::new(dst);
		writer.u8(0x82).remaining_len(len).u16(self.id.get());
		for (filter, qos) in self.filters {
			writer.utf8(filter).u8(*qos as u8);
		}

		writer.finish()
	}
}

/// Acknowledges a Subscribe. `None` entries are rejected filters.
#[derive(Debug)]
pub struct SubAck {
	pub id: PacketId,
	pub granted: Vec<Option<QoS>>,
}

impl SubAck {
	pub fn parse(frame: &Frame) -> Result<Self, ParseError> {
		let mut scanner = Scanner::new(&frame.payload[..]);
		let id = scanner.take_id()?;

		let mut granted = Vec::new();
		while scanner.has_remaining() {
			let code = scanner.take_u8()?;
			granted.push(match code {
				0x80 => None,
				code => Some(
					QoS::try_from(code).map_err(|_| {
						ParseError::MalformedPacket("invalid return code in SubAck")
					})?,
				),
			});
		}

		if granted.is_empty() {
			return Err(ParseError::MalformedPacket("SubAck carries no return codes"));
		}

		Ok(Self { id, granted })
	}
}

macro_rules! id_packet {
	($name:tt, $header:literal, $label:literal) => {
		#[derive(Debug)]
		pub struct $name {
			pub id: PacketId,
		}

		impl $name {
			pub fn parse(frame: &Frame) -> Result<Self, ParseError> {
				let mut scanner = Scanner::new(&frame.payload[..]);

				if scanner.remaining() != 2 {
					return Err(ParseError::MalformedPacket(concat!(
						$label,
						" must have length 2"
					)));
				}

				let id = scanner.take_id()?;
				Ok(Self { id })
			}
		}

		impl EncodePacket for $name {
			fn encode(&self, dst: &mut impl BufMut) -> Result<(), SerializeError> {
				let mut writer = PacketWriter::new(dst);
				writer.u8($header).remaining_len(2).u16(self.id.get());
				writer.finish()
			}
		}
	};
}

macro_rules! nul_packet {
	($name:tt, $header:literal) => {
		#[derive(Debug)]
		pub struct $name;

		impl EncodePacket for $name {
			fn encode(&self, dst: &mut impl BufMut) -> Result<(), SerializeError> {
				let mut writer = PacketWriter::new(dst);
				writer.u8($header).remaining_len(0);
				writer.finish()
			}
		}
	};
}

id_packet!(PubAck, 0x40, "PubAck");
id_packet!(PubRec, 0x50, "PubRec");
id_packet!(PubRel, 0x62, "PubRel");
id_packet!(PubComp, 0x70, "PubComp");
id_packet!(UnsubAck, 0xb0, "UnsubAck");
nul_packet!(PingReq, 0xc0);
nul_packet!(Disconnect, 0xe0);

/// A parsed broker-to-client packet.
#[derive(Debug)]
pub enum Packet<'a> {
	ConnAck(ConnAck),
	Publish(Publish<'a>),
	PubAck(PubAck),
	PubRec(PubRec),
	PubRel(PubRel),
	PubComp(PubComp),
	SubAck(SubAck),
	UnsubAck(UnsubAck),
	PingResp,
}

impl<'a> Packet<'a> {
	pub fn parse(frame: &'a Frame) -> Result<Self, ParseError> {
		match frame.header >> 4 {
			2 => Ok(Self::ConnAck(ConnAck::parse(frame)?)),
			3 => Ok(Self::Publish(Publish::parse(frame)?)),
			4 => Ok(Self::PubAck(PubAck::parse(frame)?)),
			5 => Ok(Self::PubRec(PubRec::parse(frame)?)),
			6 => Ok(Self::PubRel(PubRel::parse(frame)?)),
			7 => Ok(Self::PubComp(PubComp::parse(frame)?)),
			9 => Ok(Self::SubAck(SubAck::parse(frame)?)),
			11 => Ok(Self::UnsubAck(UnsubAck::parse(frame)?)),
			13 => {
				if !frame.payload.is_empty() {
					return Err(ParseError::MalformedPacket("PingResp must have length 0"));
				}
				Ok(Self::PingResp)
			}
			1 | 8 | 10 | 12 | 14 => Err(ParseError::MalformedPacket(
				"packet type is not valid broker to client",
			)),
			_ => Err(ParseError::InvalidHeader(frame.header)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::BytesMut;

	fn encode(packet: &impl EncodePacket) -> BytesMut {
		let mut buffer = BytesMut::new();
		packet.encode(&mut buffer).unwrap();
		buffer
	}

	fn frame_of(mut buffer: BytesMut) -> Frame {
		let frame = Frame::split_from(&mut buffer).unwrap().unwrap();
		assert!(buffer.is_empty(), "buffer held more than one frame");
		frame
	}

	#[test]
	fn remaining_length_boundaries_encode() {
		for (value, encoded) in [
			(0usize, &[0x00][..]),
			(127, &[0x7f][..]),
			(128, &[0x80, 0x01][..]),
			(16_383, &[0xff, 0x7f][..]),
			(16_384, &[0x80, 0x80, 0x01][..]),
			(MAX_REMAINING_LENGTH, &[0xff, 0xff, 0xff, 0x7f][..]),
		] {
			let mut buffer = BytesMut::new();
			let mut writer = PacketWriter::new(&mut buffer);
			writer.remaining_len(value);
			writer.finish().unwrap();
			assert_eq!(&buffer[..], encoded);
		}

		let mut buffer = BytesMut::new();
		let mut writer = PacketWriter::new(&mut buffer);
		writer.remaining_len(MAX_REMAINING_LENGTH + 1);
		assert!(writer.finish().is_err());
	}

	#[test]
	fn remaining_length_boundaries_decode() {
		for length in [0usize, 127, 128, 16_383, 16_384] {
			let mut buffer = BytesMut::new();
			let mut writer = PacketWriter::new(&mut buffer);
			writer
				.u8(0x30)
				.remaining_len(length)
				.bytes(&vec![0u8; length]);
			writer.finish().unwrap();

			let frame = frame_of(buffer);
			assert_eq!(frame.payload.len(), length);
		}
	}

	#[test]
	fn writer_failure_latches() {
		// A topic longer than the 16-bit prefix allows poisons the writer;
		// everything after it is skipped.
		let oversized = "x".repeat(u16::MAX as usize + 1);
		let mut buffer = BytesMut::new();
		let mut writer = PacketWriter::new(&mut buffer);
		writer.utf8(&oversized).u8(0xff);
		assert!(writer.finish().is_err());
	}

	#[test]
	fn connect_encodes_flags_and_fields() {
		let connect = Connect {
			client_id: "cid",
			keep_alive: 400,
			clean_session: true,
			will: None,
			credentials: None,
		};
		let buffer = encode(&connect);

		assert_eq!(buffer[0], 0x10);
		// "MQTT", level 4, flags, keep-alive, client id.
		assert_eq!(&buffer[2..10], &[0, 4, b'M', b'Q', b'T', b'T', 4, 0x02]);
		assert_eq!(&buffer[10..12], &400u16.to_be_bytes());
		assert_eq!(&buffer[12..17], &[0, 3, b'c', b'i', b'd']);
	}

	#[test]
	fn connect_will_and_credential_flags() {
		let connect = Connect {
			client_id: "cid",
			keep_alive: 60,
			clean_session: true,
			will: Some(WillRef {
				topic: "w",
				payload: b"gone",
				qos: QoS::AtLeastOnce,
				retain: true,
			}),
			credentials: Some(Credentials {
				username: "user",
				password: Some("pass"),
			}),
		};
		let buffer = encode(&connect);

		let flags = buffer[9];
		assert_eq!(flags, 0x02 | 0x04 | 0x08 | 0x20 | 0x80 | 0x40);
	}

	#[test]
	fn split_waits_for_complete_packets() {
		// Header only.
		let mut buffer = BytesMut::from(&[0x30][..]);
		assert!(Frame::split_from(&mut buffer).unwrap().is_none());

		// Declared length longer than the buffered bytes; nothing is
		// consumed while waiting.
		let mut buffer = BytesMut::from(&[0x30, 0x05, b'a'][..]);
		assert!(Frame::split_from(&mut buffer).unwrap().is_none());
		assert_eq!(buffer.len(), 3);

		// Reserved packet types are rejected.
		let mut buffer = BytesMut::from(&[0x00, 0x00][..]);
		assert!(matches!(
			Frame::split_from(&mut buffer),
			Err(ParseError::InvalidHeader(0))
		));

		// A length field that never terminates.
		let mut buffer = BytesMut::from(&[0x30, 0xff, 0xff, 0xff, 0xff, 0x01][..]);
		assert!(matches!(
			Frame::split_from(&mut buffer),
			Err(ParseError::MalformedLength)
		));

		// Two packets back to back split one at a time.
		let mut buffer = BytesMut::from(&[0xd0, 0x00, 0x40, 0x02, 0x00, 0x01][..]);
		let first = Frame::split_from(&mut buffer).unwrap().unwrap();
		assert_eq!(first.header, 0xd0);
		let second = Frame::split_from(&mut buffer).unwrap().unwrap();
		assert_eq!(second.header, 0x40);
		assert_eq!(&second.payload[..], &[0x00, 0x01]);
		assert!(buffer.is_empty());
	}

	#[test]
	fn connack_parses_and_validates() {
		let frame = frame_of(BytesMut::from(&[0x20, 0x02, 0x01, 0x00][..]));
		let ack = ConnAck::parse(&frame).unwrap();
		assert!(ack.session_present);
		assert_eq!(ack.code, ConnectReturnCode::Accepted);

		let frame = frame_of(BytesMut::from(&[0x20, 0x02, 0x00, 0x05][..]));
		let ack = ConnAck::parse(&frame).unwrap();
		assert_eq!(ack.code, ConnectReturnCode::NotAuthorized);

		let frame = frame_of(BytesMut::from(&[0x20, 0x02, 0x04, 0x00][..]));
		assert!(ConnAck::parse(&frame).is_err());
	}

	#[test]
	fn publish_qos1_round_trip() {
		let publish = Publish {
			id: PacketId::new(7),
			qos: QoS::AtLeastOnce,
			retain: false,
			duplicate: false,
			topic: "a/b",
			payload: b"hi",
		};
		let frame = frame_of(encode(&publish));

		let parsed = Publish::parse(&frame).unwrap();
		assert_eq!(parsed.id, PacketId::new(7));
		assert_eq!(parsed.qos, QoS::AtLeastOnce);
		assert_eq!(parsed.topic, "a/b");
		assert_eq!(parsed.payload, b"hi");
	}

	#[test]
	fn publish_qos0_has_no_packet_id() {
		let publish = Publish {
			id: None,
			qos: QoS::AtMostOnce,
			retain: true,
			duplicate: false,
			topic: "t",
			payload: b"x",
		};
		let frame = frame_of(encode(&publish));
		assert_eq!(frame.header, 0x31);

		let parsed = Publish::parse(&frame).unwrap();
		assert_eq!(parsed.id, None);
		assert!(parsed.retain);
		assert_eq!(parsed.payload, b"x");
	}

	#[test]
	fn suback_distinguishes_rejected_filters() {
		let frame = frame_of(BytesMut::from(&[0x90, 0x04, 0x00, 0x01, 0x01, 0x80][..]));
		let ack = SubAck::parse(&frame).unwrap();
		assert_eq!(ack.id, PacketId::new(1).unwrap());
		assert_eq!(ack.granted, vec![Some(QoS::AtLeastOnce), None]);
	}

	#[test]
	fn zero_packet_ids_are_rejected() {
		let frame = frame_of(BytesMut::from(&[0x40, 0x02, 0x00, 0x00][..]));
		assert!(matches!(
			PubAck::parse(&frame),
			Err(ParseError::ZeroPacketId)
		));
	}

	#[test]
	fn control_packets_encode_to_fixed_bytes() {
		assert_eq!(&encode(&PingReq)[..], &[0xc0, 0x00]);
		assert_eq!(&encode(&Disconnect)[..], &[0xe0, 0x00]);
		assert_eq!(
			&encode(&PubAck {
				id: PacketId::new(1).unwrap()
			})[..],
			&[0x40, 0x02, 0x00, 0x01]
		);
	}

	#[test]
	fn server_only_packets_are_rejected_inbound() {
		// A Subscribe frame arriving from the broker.
		let frame = frame_of(BytesMut::from(&[0x82, 0x02, 0x00, 0x01][..]));
		assert!(Packet::parse(&frame).is_err());
	}
}
