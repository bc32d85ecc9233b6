use crate::packets::QoS;

/// Default MQTT keep-alive, in seconds, applied when the caller passes zero.
pub const DEFAULT_KEEP_ALIVE: u16 = 400;

/// Default size of the MQTT session's send and receive buffers.
pub const DEFAULT_SESSION_BUFFER_SIZE: usize = 3 * 1024 * 1024;

/// Default size of each WebSocket ring buffer.
pub const DEFAULT_WS_BUFFER_SIZE: usize = 1024 * 1024;

/// Engine-level configuration, fixed for the lifetime of the [`Client`].
///
/// [`Client`]: crate::Client
#[derive(Debug, Clone)]
pub struct ClientOptions {
	/// Resource path used in the WebSocket upgrade request.
	pub path: String,

	/// TLS settings applied to every connection attempt.
	pub tls: TlsOptions,

	/// Capacity of the MQTT send and receive buffers, each.
	pub session_buffer_size: usize,

	/// Capacity of the WebSocket read, write, and reassembly buffers, each.
	pub ws_buffer_size: usize,
}

impl Default for ClientOptions {
	fn default() -> Self {
		Self {
			path: "/mqtt".into(),
			tls: TlsOptions::default(),
			session_buffer_size: DEFAULT_SESSION_BUFFER_SIZE,
			ws_buffer_size: DEFAULT_WS_BUFFER_SIZE,
		}
	}
}

/// TLS settings.
///
/// Server certificates are verified against the `webpki-roots` trust anchors
/// unless verification is explicitly disabled.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
	/// Disable server certificate verification. Only for test endpoints.
	pub danger_accept_invalid_certs: bool,
}

/// The MQTT CONNECT parameter bundle passed to [`Client::connect`].
///
/// [`Client::connect`]: crate::Client::connect
#[derive(Debug, Clone, Default)]
pub struct MqttOptions {
	/// Client identifier. The broker may accept an empty id.
	pub client_id: String,

	/// Login credentials. A password requires a username.
	pub username: Option<String>,
	pub password: Option<String>,

	/// Last will and testament published by the broker on abnormal
	/// disconnect.
	pub will: Option<Will>,

	/// Keep-alive timeout in seconds. Zero selects [`DEFAULT_KEEP_ALIVE`].
	pub keep_alive: u16,
}

/// Will message settings carried in the CONNECT packet.
#[derive(Debug, Clone)]
pub struct Will {
	pub topic: String,
	pub payload: Vec<u8>,
	pub qos: QoS,
	pub retain: bool,
}
