use crate::packets::ConnectReturnCode;
use crate::session::SessionError;
use std::io;

/// Errors surfaced by the client.
///
/// TLS `WANT_READ`/`WANT_WRITE` conditions are control flow inside the
/// service loop and never appear here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// Creating the poll, the wake-up pipe, or configuring the socket failed.
	#[error("failed to set up client resources: {0}")]
	Setup(#[source] io::Error),

	/// The host did not resolve to any usable address.
	#[error("could not resolve host {host:?}")]
	Resolve { host: String },

	/// The TCP connection to the endpoint could not be established.
	#[error("could not connect to {host}:{port}: {source}")]
	Connect {
		host: String,
		port: u16,
		#[source]
		source: io::Error,
	},

	/// The TLS session could not be created or failed fatally.
	#[error("tls failure: {0}")]
	Tls(#[from] rustls::Error),

	/// The transport was torn down: end of stream, socket error, or a fatal
	/// TLS status other than want-read/want-write.
	#[error("connection dropped")]
	ConnectionDropped,

	/// The WebSocket peer violated the protocol or refused the upgrade.
	#[error("websocket protocol error: {0}")]
	WsProtocol(&'static str),

	/// The MQTT session reported a protocol error during sync.
	#[error("mqtt protocol error: {0}")]
	MqttProtocol(String),

	/// The broker refused the MQTT connection in its CONNACK.
	#[error("connection refused by broker: {0}")]
	ConnectionRefused(ConnectReturnCode),

	/// The operation requires an established MQTT connection.
	#[error("client is not connected")]
	NotConnected,

	/// New submissions are rejected while a graceful disconnect is running.
	#[error("client is disconnecting")]
	Disconnecting,

	/// The caller violated an API precondition.
	#[error("invalid parameter: {0}")]
	Param(&'static str),

	/// The encoded packet does not fit the session's send buffer.
	#[error("packet does not fit the session buffer")]
	BufferFull,

	/// A deadline expired before the requested work completed.
	#[error("operation timed out")]
	TimedOut,

	/// The readiness primitive itself failed.
	#[error("poll failed: {0}")]
	Poll(#[source] io::Error),
}

impl From<SessionError> for Error {
	fn from(error: SessionError) -> Self {
		match error {
			SessionError::BufferFull => Error::BufferFull,
			other => Error::MqttProtocol(other.to_string()),
		}
	}
}
