//! The connection engine: one socket, one TLS session, one WebSocket
//! framer, one MQTT session, driven forward by [`Client::service`].
//!
//! Each service pass makes a single forward sweep through the stack:
//! TLS read into the framer, frame decode, MQTT sync, TLS write out of the
//! framer. Socket interest is rebuilt from scratch on every pass from what
//! the three state machines reported.

use crate::error::Error;
use crate::options::{ClientOptions, MqttOptions};
use crate::packets::QoS;
use crate::session::{Hooks, Session};
use crate::tls::{self, TlsStatus, TlsStream};
use crate::ws::{OpCode, WsClient, WsStatus};
use crate::PacketId;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, PipeReader, PipeWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

/// Throwaway buffer size used to drain the wake-up pipe.
const PIPE_DRAIN: usize = 32;

/// MQTT over WebSocket over TLS client.
///
/// All protocol work happens inside [`service`], which one owner thread is
/// expected to call in a loop. Submissions from other threads go through a
/// [`Notifier`] obtained up front.
///
/// [`service`]: Client::service
pub struct Client {
	options: ClientOptions,

	poll: Poll,
	events: Events,
	pipe_rx: PipeReader,
	pipe_tx: PipeWriter,

	transport: Option<TlsStream>,
	/// Interest the socket is currently registered with, if any.
	registered: Option<Interest>,

	ws: WsClient,
	session: Session,
	hooks: Hooks,

	disconnecting: bool,
	/// The read buffer was full while TLS wanted more input; the next pass
	/// must not block in poll.
	read_starved: bool,
}

/// Cross-thread handle that interrupts a blocked [`Client::service`] call.
pub struct Notifier {
	pipe: PipeWriter,
}

impl Notifier {
	/// Wakes the service thread. Never blocks; a full pipe already wakes.
	pub fn wake(&self) {
		let _ = (&self.pipe).write(b"!");
	}
}

impl Client {
	pub fn new(options: ClientOptions) -> Result<Self, Error> {
		let poll = Poll::new().map_err(Error::Setup)?;
		let (pipe_rx, pipe_tx) = io::pipe().map_err(Error::Setup)?;

		poll.registry()
			.register(
				&mut SourceFd(&pipe_rx.as_raw_fd()),
				WAKER,
				Interest::READABLE,
			)
			.map_err(Error::Setup)?;

		Ok(Self {
			ws: WsClient::new(options.ws_buffer_size),
			session: Session::new(options.session_buffer_size, options.session_buffer_size),
			options,
			poll,
			events: Events::with_capacity(8),
			pipe_rx,
			pipe_tx,
			transport: None,
			registered: None,
			hooks: Hooks::default(),
			disconnecting: false,
			read_starved: false,
		})
	}

	/// Installs the handler invoked for every inbound PUBLISH.
	pub fn set_message_handler(
		&mut self,
		handler: impl FnMut(&str, &[u8], QoS) + Send + 'static,
	) {
		self.hooks.on_message = Some(Box::new(handler));
	}

	/// Installs the handler invoked when a QoS 1 publish is acknowledged.
	pub fn set_puback_handler(&mut self, handler: impl FnMut(PacketId) + Send + 'static) {
		self.hooks.on_puback = Some(Box::new(handler));
	}

	/// Returns a handle other threads can use to interrupt [`service`].
	///
	/// [`service`]: Client::service
	pub fn notifier(&self) -> Result<Notifier, Error> {
		Ok(Notifier {
			pipe: self.pipe_tx.try_clone().map_err(Error::Setup)?,
		})
	}

	/// Establishes TCP, TLS, the WebSocket upgrade, and the MQTT session,
	/// then drives [`service`] until the broker's CONNACK arrives.
	///
	/// May be called again after a disconnect or error; buffers and
	/// handlers are retained, connection state starts over.
	///
	/// [`service`]: Client::service
	pub fn connect(
		&mut self,
		host: &str,
		port: u16,
		options: &MqttOptions,
	) -> Result<(), Error> {
		if host.is_empty() {
			return Err(Error::Param("host must not be empty"));
		}
		if options.password.is_some() && options.username.is_none() {
			return Err(Error::Param("a password requires a username"));
		}

		// Reset per-connection state; a failed attempt leaves the client
		// ready for another try.
		self.disconnecting = false;
		self.read_starved = false;
		self.session.reset();
		self.ws.reset();
		self.drop_transport();

		let addrs: Vec<_> = (host, port)
			.to_socket_addrs()
			.map_err(|_| Error::Resolve { host: host.into() })?
			.collect();
		if addrs.is_empty() {
			return Err(Error::Resolve { host: host.into() });
		}
		tracing::debug!(host, port, addr = %addrs[0], "resolved broker address");

		let stream = TcpStream::connect(&addrs[..]).map_err(|source| Error::Connect {
			host: host.into(),
			port,
			source,
		})?;
		if let Err(error) = stream.set_nodelay(true) {
			tracing::warn!(%error, "could not disable nagle");
		}
		stream.set_nonblocking(true).map_err(Error::Setup)?;

		let config = tls::client_config(&self.options.tls);
		let mut transport =
			TlsStream::new(config, host, mio::net::TcpStream::from_std(stream))?;

		// The TLS handshake completes opportunistically inside the service
		// passes below; it starts wanting to write its hello.
		let interest = Interest::READABLE | Interest::WRITABLE;
		self.poll
			.registry()
			.register(transport.socket_mut(), SOCKET, interest)
			.map_err(Error::Setup)?;
		self.registered = Some(interest);
		self.transport = Some(transport);

		self.ws
			.start_handshake(host, port, &self.options.path)
			.map_err(|error| Error::WsProtocol(error.reason()))?;

		self.session.connect(options)?;

		// Wait for the CONNACK.
		loop {
			self.service(None)?;
			if self.session.is_connected() {
				break;
			}
			if let Some(code) = self.session.refusal() {
				self.drop_transport();
				return Err(Error::ConnectionRefused(code));
			}
		}

		tracing::info!(host, port, "mqtt session established");
		Ok(())
	}

	/// One forward pass through the protocol stack.
	///
	/// Blocks in poll for at most `timeout` (`None` means indefinitely),
	/// bounded further by the keep-alive deadline while connected. Returns
	/// `Ok` after a quiet timeout so the caller can interleave other work.
	pub fn service(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
		if self.transport.is_none() {
			return Err(Error::NotConnected);
		}

		// Bound the wait so the keep-alive ping beats the broker's timer.
		let mut send_keepalive = false;
		let mut effective = timeout;
		if self.session.is_connected() {
			let till_due = self.session.next_keepalive_in(Instant::now());
			if effective.map_or(true, |t| t >= till_due) {
				effective = Some(till_due);
				send_keepalive = true;
			}
		}

		// Never block while buffered input is waiting on a previous pass.
		let pending = self.work_pending();
		if pending {
			effective = Some(Duration::ZERO);
		}

		if let Err(error) = self.poll.poll(&mut self.events, effective) {
			if error.kind() == io::ErrorKind::Interrupted {
				return Ok(());
			}
			return Err(Error::Poll(error));
		}

		let mut pipe_readable = false;
		for event in self.events.iter() {
			if event.token() == WAKER {
				pipe_readable = true;
			}
		}

		if self.events.is_empty() {
			// The pending-input override can produce an empty poll long
			// before the keep-alive bound; re-check the deadline itself.
			if send_keepalive
				&& self
					.session
					.next_keepalive_in(Instant::now())
					.is_zero()
			{
				tracing::debug!("keep-alive due, queueing ping");
				self.session.ping()?;
			} else if !pending {
				// Quiet timeout; hand control back to the caller.
				return Ok(());
			}
		}

		// Interest is rebuilt from what this pass observes.
		let mut interest: Option<Interest> = None;
		self.read_starved = false;

		// TLS read: fill the framer's read buffer with decrypted bytes.
		let transport = self.transport.as_mut().expect("checked above");
		loop {
			let span = self.ws.buf_read.insert_range();
			if span.is_empty() {
				// Backpressure: leave the socket unarmed until the framer
				// frees space, but come straight back to it.
				if !self.ws.buf_read.is_empty() {
					self.read_starved = true;
				}
				break;
			}
			match transport.read_into(span) {
				Ok(TlsStatus::Progress(count)) => {
					self.ws.buf_read.commit(count);
				}
				Ok(TlsStatus::WantRead) => {
					add_interest(&mut interest, Interest::READABLE);
					break;
				}
				Ok(TlsStatus::WantWrite) => {
					add_interest(&mut interest, Interest::WRITABLE);
					break;
				}
				Err(error) => {
					self.session.drop_connection();
					return Err(error);
				}
			}
		}

		// WebSocket: decode frames, reassemble payloads for the session.
		match self.ws.process() {
			Ok(WsStatus::NeedMoreBytes) => {
				add_interest(&mut interest, Interest::READABLE);
			}
			Ok(WsStatus::Closed) => {
				tracing::debug!("websocket closed by peer");
			}
			Ok(WsStatus::Idle) => {}
			Err(error) => {
				tracing::error!(%error, "websocket failure");
				self.session.drop_connection();
				return Err(Error::WsProtocol(error.reason()));
			}
		}

		// MQTT: dispatch inbound packets, re-encode outbound into the
		// framer's write buffer.
		if self.ws.is_established() {
			if let Err(error) = self.session.sync(&mut self.ws, &mut self.hooks) {
				tracing::error!(%error, "mqtt sync failed");
				self.session.drop_connection();
				return Err(error.into());
			}
			if self.session.take_partial_write() {
				add_interest(&mut interest, Interest::WRITABLE);
			}
		}

		// TLS write: drain the framer's write buffer to the socket.
		let transport = self.transport.as_mut().expect("checked above");
		loop {
			let span = self.ws.buf_write.read_range();
			if span.is_empty() && !transport.wants_write() {
				break;
			}
			match transport.write_from(span) {
				Ok(TlsStatus::Progress(count)) => {
					self.ws.buf_write.consume(count);
					if count == 0 {
						break;
					}
				}
				Ok(TlsStatus::WantRead) => {
					add_interest(&mut interest, Interest::READABLE);
					break;
				}
				Ok(TlsStatus::WantWrite) => {
					add_interest(&mut interest, Interest::WRITABLE);
					break;
				}
				Err(error) => {
					self.session.drop_connection();
					return Err(error);
				}
			}
		}
		if transport.wants_write() {
			// Ciphertext is still queued inside the TLS session.
			add_interest(&mut interest, Interest::WRITABLE);
		}

		if pipe_readable {
			let mut throwaway = [0u8; PIPE_DRAIN];
			let _ = self.pipe_rx.read(&mut throwaway);
		}

		self.update_registration(interest)?;
		Ok(())
	}

	/// Schedules a PUBLISH. QoS 0, 1 and 2 are supported; the assigned
	/// packet id is discarded, use [`publish_with_id`] to track
	/// acknowledgements.
	///
	/// [`publish_with_id`]: Client::publish_with_id
	pub fn publish(
		&mut self,
		topic: &str,
		payload: &[u8],
		qos: QoS,
		retain: bool,
	) -> Result<(), Error> {
		if self.disconnecting {
			return Err(Error::Disconnecting);
		}
		self.publish_with_id(topic, payload, qos, retain).map(|_| ())
	}

	/// Schedules a PUBLISH and returns the packet id assigned to it, which
	/// a QoS 1 acknowledgement will echo to the puback handler.
	pub fn publish_with_id(
		&mut self,
		topic: &str,
		payload: &[u8],
		qos: QoS,
		retain: bool,
	) -> Result<Option<PacketId>, Error> {
		if !self.session.is_connected() {
			return Err(Error::NotConnected);
		}
		if topic.is_empty() {
			return Err(Error::Param("topic must not be empty"));
		}

		let id = self.session.publish(topic, payload, qos, retain)?;
		tracing::debug!(topic, len = payload.len(), qos = ?qos, id = ?id, "publish queued");

		self.wake();
		Ok(id)
	}

	/// Schedules a SUBSCRIBE for `filter` at up to `max_qos`.
	pub fn subscribe(&mut self, filter: &str, max_qos: QoS) -> Result<PacketId, Error> {
		if !self.session.is_connected() {
			return Err(Error::NotConnected);
		}
		if self.disconnecting {
			return Err(Error::Disconnecting);
		}
		if filter.is_empty() {
			return Err(Error::Param("filter must not be empty"));
		}

		let id = self.session.subscribe(filter, max_qos)?;
		tracing::debug!(filter, qos = ?max_qos, id = id.get(), "subscribe queued");

		self.wake();
		Ok(id)
	}

	/// Gracefully shuts the stack down, spending up to a quarter of
	/// `timeout` on each stage: flushing in-flight data, the MQTT
	/// DISCONNECT, the WebSocket close frame, and the peer's teardown.
	///
	/// Calling this twice is harmless; without a live transport it returns
	/// immediately.
	pub fn disconnect(&mut self, timeout: Duration) -> Result<(), Error> {
		if self.transport.is_none() {
			return Ok(());
		}

		// Block new submissions for the duration.
		self.disconnecting = true;
		let quarter = timeout / 4;

		if let Err(error) = self.service_all(quarter) {
			tracing::error!(%error, "could not flush in-flight data before disconnect");
		}

		// Schedule and send the MQTT disconnect.
		if let Err(error) = self.session.disconnect() {
			tracing::error!(%error, "could not queue mqtt disconnect");
		}
		if let Err(error) = self.session.sync(&mut self.ws, &mut self.hooks) {
			tracing::error!(%error, "mqtt sync failed during disconnect");
		}
		if let Err(error) = self.service_all(quarter) {
			tracing::error!(%error, "could not flush the mqtt disconnect");
		}

		// WebSocket close, status 1000. Many brokers tear the connection
		// down on the MQTT disconnect, so failures here stay warnings.
		if self.ws.send(OpCode::Close, &1000u16.to_be_bytes()) == 0 {
			tracing::warn!("could not queue the websocket close frame");
		}
		if let Err(error) = self.service_all(quarter) {
			tracing::warn!(%error, "websocket close may not have reached the peer");
		}

		// Service until the peer drops the connection, which is the usual
		// ending, or the last quarter of the budget runs out.
		let deadline = Instant::now() + quarter;
		loop {
			let now = Instant::now();
			if now >= deadline {
				break;
			}
			if self.service(Some(deadline - now)).is_err() {
				break;
			}
		}

		self.session.drop_connection();
		self.drop_transport();
		tracing::info!("disconnected");
		Ok(())
	}

	/// Services the connection until the framer's write buffer drains or
	/// the deadline passes.
	fn service_all(&mut self, timeout: Duration) -> Result<(), Error> {
		let deadline = Instant::now() + timeout;

		// Make the first poll wake on writability; later passes re-arm
		// from their own observations.
		self.arm_write_interest()?;

		while !self.ws.buf_write.is_empty() {
			let now = Instant::now();
			if now >= deadline {
				return Err(Error::TimedOut);
			}
			self.service(Some(deadline - now))?;
		}
		Ok(())
	}

	fn arm_write_interest(&mut self) -> Result<(), Error> {
		if self.transport.is_some() {
			let current = self.registered.unwrap_or(Interest::READABLE);
			self.update_registration(Some(current | Interest::WRITABLE))?;
		}
		Ok(())
	}

	/// True when buffered input from an earlier pass is still waiting, in
	/// which case poll must not block.
	fn work_pending(&self) -> bool {
		self.read_starved
			|| !self.ws.buf_read.is_empty()
			|| self
				.transport
				.as_ref()
				.is_some_and(TlsStream::pending_plaintext)
	}

	/// Applies this pass's interest to the poll registration. `None`
	/// deregisters the socket entirely (read backpressure with nothing to
	/// write).
	fn update_registration(&mut self, want: Option<Interest>) -> Result<(), Error> {
		let Some(transport) = self.transport.as_mut() else {
			return Ok(());
		};

		match (want, self.registered) {
			(None, Some(_)) => {
				self.poll
					.registry()
					.deregister(transport.socket_mut())
					.map_err(Error::Poll)?;
				self.registered = None;
			}
			(Some(interest), None) => {
				self.poll
					.registry()
					.register(transport.socket_mut(), SOCKET, interest)
					.map_err(Error::Poll)?;
				self.registered = Some(interest);
			}
			(Some(interest), Some(current)) if interest != current => {
				self.poll
					.registry()
					.reregister(transport.socket_mut(), SOCKET, interest)
					.map_err(Error::Poll)?;
				self.registered = Some(interest);
			}
			_ => {}
		}
		Ok(())
	}

	fn drop_transport(&mut self) {
		if let Some(mut transport) = self.transport.take() {
			if self.registered.take().is_some() {
				let _ = self.poll.registry().deregister(transport.socket_mut());
			}
		}
	}

	fn wake(&mut self) {
		if let Err(error) = self.pipe_tx.write(b"!") {
			tracing::debug!(%error, "wake-up write failed");
		}
	}
}

/// Folds another readiness interest into the accumulator.
fn add_interest(interest: &mut Option<Interest>, add: Interest) {
	*interest = Some(match *interest {
		Some(current) => current | add,
		None => add,
	});
}

#[cfg(test)]
mod tests {
	use super::*;

	fn client() -> Client {
		Client::new(ClientOptions::default()).unwrap()
	}

	#[test]
	fn submissions_require_a_connection() {
		let mut client = client();
		assert!(matches!(
			client.publish("t", b"x", QoS::AtMostOnce, false),
			Err(Error::NotConnected)
		));
		assert!(matches!(
			client.publish_with_id("t", b"x", QoS::AtLeastOnce, false),
			Err(Error::NotConnected)
		));
		assert!(matches!(
			client.subscribe("t/#", QoS::AtLeastOnce),
			Err(Error::NotConnected)
		));
	}

	#[test]
	fn service_requires_a_connection() {
		let mut client = client();
		assert!(matches!(
			client.service(Some(Duration::ZERO)),
			Err(Error::NotConnected)
		));
	}

	#[test]
	fn disconnect_without_a_connection_is_a_no_op() {
		let mut client = client();
		client.disconnect(Duration::from_secs(4)).unwrap();
		client.disconnect(Duration::from_secs(4)).unwrap();
	}

	#[test]
	fn connect_validates_parameters() {
		let mut client = client();
		assert!(matches!(
			client.connect("", 8883, &MqttOptions::default()),
			Err(Error::Param(_))
		));

		let options = MqttOptions {
			password: Some("secret".into()),
			..Default::default()
		};
		assert!(matches!(
			client.connect("broker.example", 8883, &options),
			Err(Error::Param(_))
		));
	}

	#[test]
	fn notifier_wakes_without_a_connection() {
		let client = client();
		let notifier = client.notifier().unwrap();
		// Nothing is serviced here; the write itself must not fail or block.
		notifier.wake();
		notifier.wake();
	}

	#[test]
	fn interest_accumulates() {
		let mut interest = None;
		add_interest(&mut interest, Interest::READABLE);
		assert_eq!(interest, Some(Interest::READABLE));
		add_interest(&mut interest, Interest::WRITABLE);
		assert_eq!(interest, Some(Interest::READABLE | Interest::WRITABLE));
	}
}
