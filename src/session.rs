//! MQTT session state: packet queues, id allocation, pending
//! acknowledgements, and keep-alive bookkeeping.
//!
//! The session never touches a socket. All bytes flow through a [`Channel`],
//! the seam behind which the WebSocket framer sits.

use crate::options::{MqttOptions, DEFAULT_KEEP_ALIVE};
use crate::packets::{
	ConnAck, Connect, ConnectReturnCode, Credentials, Disconnect, EncodePacket, Frame, Packet,
	ParseError, PingReq, PubAck, PubComp, PubRec, PubRel, Publish, QoS, Subscribe, WillRef,
};
use crate::PacketId;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU16;
use std::time::{Duration, Instant};

/// How much to pull from the channel per read.
const RECV_CHUNK: usize = 4096;

/// The keep-alive ping is sent at this fraction of the negotiated interval.
const KEEP_ALIVE_NUM: u32 = 3;
const KEEP_ALIVE_DEN: u32 = 4;

/// Byte transport between the session and the framing layer below it.
///
/// `send` accepts a prefix of `buf` and returns its length; zero means the
/// layer below is out of space. `recv` fills `buf` with reassembled inbound
/// bytes; zero is a valid no-data result.
pub trait Channel {
	fn send(&mut self, buf: &[u8]) -> usize;
	fn recv(&mut self, buf: &mut [u8]) -> usize;
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
	#[error("{0}")]
	Protocol(&'static str),
	#[error("malformed packet: {0}")]
	Parse(#[from] ParseError),
	#[error("session send buffer exhausted")]
	BufferFull,
	#[error("inbound packet exceeds the receive buffer")]
	PacketTooLarge,
}

/// Application callbacks dispatched from [`Session::sync`].
pub type MessageHandler = Box<dyn FnMut(&str, &[u8], QoS) + Send>;
pub type PubAckHandler = Box<dyn FnMut(PacketId) + Send>;

#[derive(Default)]
pub struct Hooks {
	pub on_message: Option<MessageHandler>,
	pub on_puback: Option<PubAckHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
	Disconnected,
	/// CONNECT queued, CONNACK outstanding.
	Connecting,
	Connected,
	Refused(ConnectReturnCode),
}

/// Outbound QoS 1/2 publishes awaiting their acknowledgement exchange.
#[derive(Debug, Clone, Copy)]
enum PublishState {
	AwaitingAck,
	AwaitingRec,
	AwaitingComp,
}

pub struct Session {
	/// Encoded outbound packets, drained through the channel in FIFO order.
	outgoing: BytesMut,
	send_limit: usize,

	/// Inbound byte stream, reassembled into frames.
	incoming: BytesMut,
	recv_limit: usize,

	state: SessionState,
	next_id: NonZeroU16,
	pending_publish: HashMap<PacketId, PublishState>,
	pending_subscribe: HashSet<PacketId>,

	keep_alive: Duration,
	last_send: Instant,
	ping_inflight: Option<Instant>,

	/// The channel accepted fewer bytes than offered; the caller must arm
	/// write interest and retry on the next pass.
	partial_write: bool,
}

impl Session {
	pub fn new(send_limit: usize, recv_limit: usize) -> Self {
		Self {
			outgoing: BytesMut::new(),
			send_limit,
			incoming: BytesMut::new(),
			recv_limit,
			state: SessionState::Disconnected,
			next_id: NonZeroU16::MIN,
			pending_publish: HashMap::new(),
			pending_subscribe: HashSet::new(),
			keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE.into()),
			last_send: Instant::now(),
			ping_inflight: None,
			partial_write: false,
		}
	}

	/// Discards per-connection state ahead of a (re)connect. Buffers keep
	/// their allocations.
	pub fn reset(&mut self) {
		self.outgoing.clear();
		self.incoming.clear();
		self.state = SessionState::Disconnected;
		self.next_id = NonZeroU16::MIN;
		self.pending_publish.clear();
		self.pending_subscribe.clear();
		self.ping_inflight = None;
		self.partial_write = false;
		self.last_send = Instant::now();
	}

	pub fn is_connected(&self) -> bool {
		self.state == SessionState::Connected
	}

	/// The CONNACK refusal code, if the broker rejected the session.
	pub fn refusal(&self) -> Option<ConnectReturnCode> {
		match self.state {
			SessionState::Refused(code) => Some(code),
			_ => None,
		}
	}

	/// Marks the session dead after a terminal error or disconnect.
	pub fn drop_connection(&mut self) {
		self.state = SessionState::Disconnected;
	}

	/// Returns and clears the short-write flag.
	pub fn take_partial_write(&mut self) -> bool {
		std::mem::take(&mut self.partial_write)
	}

	/// Time until the keep-alive ping falls due, measured from the last
	/// packet egress. Pings are scheduled at three quarters of the interval
	/// so they beat the broker's deadline.
	pub fn next_keepalive_in(&self, now: Instant) -> Duration {
		let due = self.last_send + (self.keep_alive * KEEP_ALIVE_NUM) / KEEP_ALIVE_DEN;
		due.saturating_duration_since(now)
	}

	/// Queues the CONNECT packet and arms the session for the CONNACK.
	pub fn connect(&mut self, options: &MqttOptions) -> Result<(), SessionError> {
		let keep_alive = match options.keep_alive {
			0 => DEFAULT_KEEP_ALIVE,
			value => value,
		};
		self.keep_alive = Duration::from_secs(keep_alive.into());

		let credentials = options.username.as_deref().map(|username| Credentials {
			username,
			password: options.password.as_deref(),
		});

		let will = options.will.as_ref().map(|will| WillRef {
			topic: &will.topic,
			payload: &will.payload,
			qos: will.qos,
			retain: will.retain,
		});

		self.queue(&Connect {
			client_id: &options.client_id,
			keep_alive,
			// Sessions are always clean; nothing is resumed across connects.
			clean_session: true,
			will,
			credentials,
		})?;

		self.state = SessionState::Connecting;
		Ok(())
	}

	/// Queues a PUBLISH, returning the packet id for QoS 1 and 2.
	pub fn publish(
		&mut self,
		topic: &str,
		payload: &[u8],
		qos: QoS,
		retain: bool,
	) -> Result<Option<PacketId>, SessionError> {
		let id = match qos {
			QoS::AtMostOnce => None,
			QoS::AtLeastOnce | QoS::ExactlyOnce => Some(self.allocate_id()),
		};

		self.queue(&Publish {
			id,
			qos,
			retain,
			duplicate: false,
			topic,
			payload,
		})?;

		if let Some(id) = id {
			let state = match qos {
				QoS::AtLeastOnce => PublishState::AwaitingAck,
				_ => PublishState::AwaitingRec,
			};
			self.pending_publish.insert(id, state);
		}

		Ok(id)
	}

	/// Queues a SUBSCRIBE for a single filter.
	pub fn subscribe(&mut self, filter: &str, max_qos: QoS) -> Result<PacketId, SessionError> {
		let id = self.allocate_id();
		self.queue(&Subscribe {
			id,
			filters: &[(filter, max_qos)],
		})?;
		self.pending_subscribe.insert(id);
		Ok(id)
	}

	/// Queues a PINGREQ.
	pub fn ping(&mut self) -> Result<(), SessionError> {
		self.queue(&PingReq)?;
		self.ping_inflight = Some(Instant::now());
		Ok(())
	}

	/// Queues the DISCONNECT packet.
	pub fn disconnect(&mut self) -> Result<(), SessionError> {
		self.queue(&Disconnect)
	}

	/// One full exchange with the layer below: decode and dispatch whatever
	/// arrived, then push queued packets out.
	pub fn sync(
		&mut self,
		channel: &mut impl Channel,
		hooks: &mut Hooks,
	) -> Result<(), SessionError> {
		self.pump_incoming(channel, hooks)?;
		self.pump_outgoing(channel);
		Ok(())
	}

	fn allocate_id(&mut self) -> PacketId {
		let id = self.next_id;
		self.next_id = id.checked_add(1).unwrap_or(NonZeroU16::MIN);
		id
	}

	/// Serializes `packet` to the send buffer, enforcing its capacity.
	fn queue(&mut self, packet: &impl EncodePacket) -> Result<(), SessionError> {
		let start = self.outgoing.len();
		let room = self.send_limit.saturating_sub(start);
		if packet.encode(&mut (&mut self.outgoing).limit(room)).is_err() {
			self.outgoing.truncate(start);
			return Err(SessionError::BufferFull);
		}
		Ok(())
	}

	fn pump_incoming(
		&mut self,
		channel: &mut impl Channel,
		hooks: &mut Hooks,
	) -> Result<(), SessionError> {
		loop {
			// Top the receive buffer up from the channel.
			let start = self.incoming.len();
			let room = std::cmp::min(RECV_CHUNK, self.recv_limit.saturating_sub(start));
			let received = if room > 0 {
				self.incoming.resize(start + room, 0);
				let count = channel.recv(&mut self.incoming[start..]);
				self.incoming.truncate(start + count);
				count
			} else {
				0
			};

			// Drain every complete frame.
			while let Some(frame) = Frame::split_from(&mut self.incoming)? {
				self.handle_packet(&frame, hooks)?;
			}

			if received == 0 {
				break;
			}
		}

		if self.incoming.len() >= self.recv_limit {
			return Err(SessionError::PacketTooLarge);
		}

		Ok(())
	}

	fn pump_outgoing(&mut self, channel: &mut impl Channel) {
		while !self.outgoing.is_empty() {
			let offered = self.outgoing.len();
			let sent = channel.send(&self.outgoing[..]);
			if sent > 0 {
				self.outgoing.advance(sent);
				self.last_send = Instant::now();
			}
			if sent < offered {
				self.partial_write = true;
				break;
			}
		}
	}

	fn handle_packet(&mut self, frame: &Frame, hooks: &mut Hooks) -> Result<(), SessionError> {
		match Packet::parse(frame)? {
			Packet::ConnAck(ack) => self.handle_connack(ack),
			Packet::Publish(publish) => {
				tracing::trace!(
					topic = publish.topic,
					len = publish.payload.len(),
					qos = ?publish.qos,
					"inbound publish"
				);

				if let Some(on_message) = hooks.on_message.as_mut() {
					on_message(publish.topic, publish.payload, publish.qos);
				}

				match (publish.qos, publish.id) {
					(QoS::AtMostOnce, _) => {}
					(QoS::AtLeastOnce, Some(id)) => self.queue(&PubAck { id })?,
					(QoS::ExactlyOnce, Some(id)) => self.queue(&PubRec { id })?,
					_ => unreachable!("parser enforces ids on qos > 0"),
				}
				Ok(())
			}
			Packet::PubAck(PubAck { id }) => {
				match self.pending_publish.remove(&id) {
					Some(PublishState::AwaitingAck) => {
						if let Some(on_puback) = hooks.on_puback.as_mut() {
							on_puback(id);
						}
						Ok(())
					}
					Some(state) => {
						self.pending_publish.insert(id, state);
						Err(SessionError::Protocol("PubAck for a qos 2 publish"))
					}
					None => Err(SessionError::Protocol("unsolicited PubAck")),
				}
			}
			Packet::PubRec(PubRec { id }) => {
				match self.pending_publish.remove(&id) {
					Some(PublishState::AwaitingRec) => {
						self.pending_publish.insert(id, PublishState::AwaitingComp);
						self.queue(&PubRel { id })
					}
					Some(state) => {
						self.pending_publish.insert(id, state);
						Err(SessionError::Protocol("PubRec for a qos 1 publish"))
					}
					None => Err(SessionError::Protocol("unsolicited PubRec")),
				}
			}
			Packet::PubComp(PubComp { id }) => {
				match self.pending_publish.remove(&id) {
					Some(PublishState::AwaitingComp) => {
						tracing::trace!(id = id.get(), "qos 2 publish complete");
						Ok(())
					}
					Some(state) => {
						self.pending_publish.insert(id, state);
						Err(SessionError::Protocol("unexpected PubComp"))
					}
					None => Err(SessionError::Protocol("unsolicited PubComp")),
				}
			}
			Packet::PubRel(PubRel { id }) => {
				// Inbound qos 2 messages are delivered on arrival, so the
				// release carries no state beyond the completion reply.
				self.queue(&PubComp { id })
			}
			Packet::SubAck(ack) => {
				if !self.pending_subscribe.remove(&ack.id) {
					return Err(SessionError::Protocol("unsolicited SubAck"));
				}
				tracing::debug!(id = ack.id.get(), granted = ?ack.granted, "subscription acknowledged");
				Ok(())
			}
			Packet::UnsubAck(_) => Err(SessionError::Protocol("unsolicited UnsubAck")),
			Packet::PingResp => {
				let Some(sent) = self.ping_inflight.take() else {
					return Err(SessionError::Protocol("unsolicited PingResp"));
				};
				tracing::trace!(elapsed = ?sent.elapsed(), "ping answered");
				Ok(())
			}
		}
	}

	fn handle_connack(&mut self, ack: ConnAck) -> Result<(), SessionError> {
		if self.state == SessionState::Connected {
			return Err(SessionError::Protocol("unexpected ConnAck"));
		}

		match ack.code {
			ConnectReturnCode::Accepted => {
				tracing::debug!(
					session_present = ack.session_present,
					"mqtt connection accepted"
				);
				self.state = SessionState::Connected;
			}
			code => {
				tracing::error!(%code, "mqtt connection refused");
				self.state = SessionState::Refused(code);
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::options::Will;
	use crate::ws::WsClient;

	const LIMIT: usize = 64 * 1024;

	fn session() -> Session {
		Session::new(LIMIT, LIMIT)
	}

	/// A channel backed by plain vectors: `send` accepts up to `accept_max`
	/// bytes per call, `recv` replays scripted input.
	#[derive(Default)]
	struct TestChannel {
		sent: Vec<u8>,
		accept_max: Option<usize>,
		inbound: Vec<u8>,
	}

	impl Channel for TestChannel {
		fn send(&mut self, buf: &[u8]) -> usize {
			let take = self.accept_max.map_or(buf.len(), |max| buf.len().min(max));
			self.sent.extend_from_slice(&buf[..take]);
			take
		}

		fn recv(&mut self, buf: &mut [u8]) -> usize {
			let take = buf.len().min(self.inbound.len());
			buf[..take].copy_from_slice(&self.inbound[..take]);
			self.inbound.drain(..take);
			take
		}
	}

	fn connected_session() -> Session {
		let mut session = session();
		session
			.connect(&MqttOptions {
				client_id: "test".into(),
				..Default::default()
			})
			.unwrap();
		let mut channel = TestChannel {
			inbound: vec![0x20, 0x02, 0x00, 0x00],
			..Default::default()
		};
		session.sync(&mut channel, &mut Hooks::default()).unwrap();
		assert!(session.is_connected());
		session
	}

	#[test]
	fn connect_applies_the_default_keep_alive() {
		let mut session = session();
		session.connect(&MqttOptions::default()).unwrap();
		assert_eq!(session.keep_alive, Duration::from_secs(400));
		assert_eq!(session.outgoing[0], 0x10);
	}

	#[test]
	fn connect_carries_will_and_credentials() {
		let mut session = session();
		session
			.connect(&MqttOptions {
				client_id: "c".into(),
				username: Some("user".into()),
				password: Some("pass".into()),
				will: Some(Will {
					topic: "gone".into(),
					payload: b"bye".to_vec(),
					qos: QoS::AtLeastOnce,
					retain: false,
				}),
				keep_alive: 30,
			})
			.unwrap();

		// Flags byte: clean session, will, will qos 1, username, password.
		let flags = session.outgoing[9];
		assert_eq!(flags, 0x02 | 0x04 | 0x08 | 0x80 | 0x40);
		assert_eq!(session.keep_alive, Duration::from_secs(30));
	}

	#[test]
	fn refused_connack_is_reported() {
		let mut session = session();
		session.connect(&MqttOptions::default()).unwrap();

		let mut channel = TestChannel {
			inbound: vec![0x20, 0x02, 0x00, 0x05],
			..Default::default()
		};
		session.sync(&mut channel, &mut Hooks::default()).unwrap();
		assert!(!session.is_connected());
		assert_eq!(session.refusal(), Some(ConnectReturnCode::NotAuthorized));
	}

	#[test]
	fn publish_allocates_sequential_ids() {
		let mut session = connected_session();
		let first = session.publish("t", b"1", QoS::AtLeastOnce, false).unwrap();
		let second = session.publish("t", b"2", QoS::AtLeastOnce, false).unwrap();
		assert_eq!(first, PacketId::new(1));
		assert_eq!(second, PacketId::new(2));
	}

	#[test]
	fn qos0_publish_has_no_id() {
		let mut session = connected_session();
		assert_eq!(
			session.publish("t", b"x", QoS::AtMostOnce, false).unwrap(),
			None
		);
		assert!(session.pending_publish.is_empty());
	}

	#[test]
	fn puback_fires_the_hook_once() {
		let mut session = connected_session();
		let id = session
			.publish("t", b"x", QoS::AtLeastOnce, false)
			.unwrap()
			.unwrap();

		let counter = std::sync::Arc::new(std::sync::atomic::AtomicU16::new(0));
		let observer = counter.clone();
		let mut hooks = Hooks::default();
		hooks.on_puback = Some(Box::new(move |packet_id| {
			observer.store(packet_id.get(), std::sync::atomic::Ordering::SeqCst);
		}));

		let mut channel = TestChannel::default();
		session.sync(&mut channel, &mut hooks).unwrap();

		// Feed the matching PubAck back in.
		channel.inbound = vec![0x40, 0x02, 0x00, id.get() as u8];
		session.sync(&mut channel, &mut hooks).unwrap();

		assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), id.get());
		assert!(session.pending_publish.is_empty());
	}

	#[test]
	fn unsolicited_acks_are_protocol_errors() {
		let mut session = connected_session();
		let mut channel = TestChannel {
			inbound: vec![0x40, 0x02, 0x00, 0x09],
			..Default::default()
		};
		assert!(session
			.sync(&mut channel, &mut Hooks::default())
			.is_err());
	}

	#[test]
	fn qos2_publish_walks_the_full_exchange() {
		let mut session = connected_session();
		let id = session
			.publish("t", b"x", QoS::ExactlyOnce, false)
			.unwrap()
			.unwrap();

		let mut channel = TestChannel::default();
		session.sync(&mut channel, &mut Hooks::default()).unwrap();
		channel.sent.clear();

		// PubRec triggers PubRel.
		channel.inbound = vec![0x50, 0x02, 0x00, id.get() as u8];
		session.sync(&mut channel, &mut Hooks::default()).unwrap();
		assert_eq!(channel.sent, vec![0x62, 0x02, 0x00, id.get() as u8]);

		// PubComp retires the id.
		channel.inbound = vec![0x70, 0x02, 0x00, id.get() as u8];
		session.sync(&mut channel, &mut Hooks::default()).unwrap();
		assert!(session.pending_publish.is_empty());
	}

	#[test]
	fn inbound_publish_is_delivered_and_acknowledged() {
		let mut session = connected_session();

		let received = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
		let sink = received.clone();
		let mut hooks = Hooks::default();
		hooks.on_message = Some(Box::new(move |topic, payload, qos| {
			sink.lock()
				.unwrap()
				.push((topic.to_owned(), payload.to_vec(), qos));
		}));

		// Publish "42" on "s/x" with qos 1, packet id 7.
		let mut channel = TestChannel {
			inbound: vec![
				0x32, 0x09, 0x00, 0x03, b's', b'/', b'x', 0x00, 0x07, b'4', b'2',
			],
			..Default::default()
		};
		session.sync(&mut channel, &mut hooks).unwrap();

		let received = received.lock().unwrap();
		assert_eq!(
			received[..],
			[("s/x".to_owned(), b"42".to_vec(), QoS::AtLeastOnce)]
		);

		// The PubAck goes straight back out.
		assert_eq!(channel.sent, vec![0x40, 0x02, 0x00, 0x07]);
	}

	#[test]
	fn inbound_qos2_release_is_completed() {
		let mut session = connected_session();
		let mut channel = TestChannel {
			inbound: vec![0x62, 0x02, 0x00, 0x03],
			..Default::default()
		};
		session.sync(&mut channel, &mut Hooks::default()).unwrap();
		assert_eq!(channel.sent, vec![0x70, 0x02, 0x00, 0x03]);
	}

	#[test]
	fn short_channel_writes_set_the_partial_flag() {
		let mut session = connected_session();
		session.publish("topic", &[0u8; 64], QoS::AtMostOnce, false).unwrap();

		let mut channel = TestChannel {
			accept_max: Some(10),
			..Default::default()
		};
		session.sync(&mut channel, &mut Hooks::default()).unwrap();
		assert!(session.take_partial_write());
		assert!(!session.take_partial_write());
		assert!(!session.outgoing.is_empty());

		// A roomier pass drains the rest without losing bytes.
		let mut roomy = TestChannel::default();
		session.sync(&mut roomy, &mut Hooks::default()).unwrap();
		assert!(session.outgoing.is_empty());
	}

	#[test]
	fn keepalive_is_scheduled_at_three_quarters() {
		let mut session = session();
		session
			.connect(&MqttOptions {
				keep_alive: 10,
				..Default::default()
			})
			.unwrap();

		let now = session.last_send;
		let due = session.next_keepalive_in(now);
		assert_eq!(due, Duration::from_millis(7500));
	}

	#[test]
	fn any_egress_pushes_the_keepalive_out() {
		let mut session = connected_session();
		let before = session.last_send;
		std::thread::sleep(Duration::from_millis(5));

		session.publish("t", b"x", QoS::AtMostOnce, false).unwrap();
		let mut channel = TestChannel::default();
		session.sync(&mut channel, &mut Hooks::default()).unwrap();
		assert!(session.last_send > before);
	}

	#[test]
	fn ping_response_requires_a_ping() {
		let mut session = connected_session();
		let mut channel = TestChannel {
			inbound: vec![0xd0, 0x00],
			..Default::default()
		};
		assert!(session.sync(&mut channel, &mut Hooks::default()).is_err());

		session.ping().unwrap();
		let mut channel = TestChannel {
			inbound: vec![0xd0, 0x00],
			..Default::default()
		};
		session.sync(&mut channel, &mut Hooks::default()).unwrap();
	}

	#[test]
	fn oversized_packets_are_rejected_at_queue_time() {
		let mut session = Session::new(128, 128);
		session.state = SessionState::Connected;
		assert!(matches!(
			session.publish("topic", &[0u8; 256], QoS::AtMostOnce, false),
			Err(SessionError::BufferFull)
		));
		// A failed queue leaves no partial bytes behind.
		assert!(session.outgoing.is_empty());
	}

	/// The session talks to a real framer: CONNECT flows out as a masked
	/// binary frame, the broker's CONNACK flows back in through the
	/// reassembly buffer.
	#[test]
	fn session_and_framer_plumb_together() {
		let mut session = session();
		let mut ws = WsClient::new(4096);
		ws.force_established();

		session
			.connect(&MqttOptions {
				client_id: "plumb".into(),
				..Default::default()
			})
			.unwrap();
		session.sync(&mut ws, &mut Hooks::default()).unwrap();
		assert!(session.outgoing.is_empty());
		assert!(!ws.buf_write.is_empty());

		// Broker answers with CONNACK inside a binary frame.
		ws.buf_read.push(&[0x82, 0x04, 0x20, 0x02, 0x00, 0x00]);
		ws.process().unwrap();
		session.sync(&mut ws, &mut Hooks::default()).unwrap();
		assert!(session.is_connected());
	}
}
