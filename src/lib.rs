#![allow(clippy::tabs_in_doc_comments)]
//! # mqtt-wss
//!
//! An MQTT v3.1.1 client that carries its traffic over a WebSocket
//! connection tunneled inside TLS, producing the composite stack
//! `MQTT / WebSocket / TLS / TCP` on a single non-blocking socket.
//!
//! The engine is a readiness-driven service loop: each call to
//! [`Client::service`] makes one forward pass through TLS input, WebSocket
//! deframing, MQTT dispatch, and TLS output, then re-arms socket interest
//! from what the protocol layers reported. A self-pipe lets other threads
//! interrupt a blocked pass when they submit work.
//!
//! ```no_run
//! use mqtt_wss::{Client, ClientOptions, MqttOptions, QoS};
//!
//! fn main() -> mqtt_wss::Result<()> {
//! 	let mut client = Client::new(ClientOptions::default())?;
//! 	client.set_message_handler(|topic, payload, _qos| {
//! 		println!("{topic}: {} bytes", payload.len());
//! 	});
//!
//! 	client.connect(
//! 		"broker.example",
//! 		8883,
//! 		&MqttOptions {
//! 			client_id: "demo".into(),
//! 			..Default::default()
//! 		},
//! 	)?;
//!
//! 	client.subscribe("sensors/#", QoS::AtLeastOnce)?;
//! 	client.publish("sensors/hello", b"hi", QoS::AtLeastOnce, false)?;
//!
//! 	loop {
//! 		client.service(None)?;
//! 	}
//! }
//! ```

mod buffer;
mod client;
mod error;
mod options;
mod packets;
mod session;
mod tls;
mod ws;

pub use client::{Client, Notifier};
pub use error::Error;
pub use options::{ClientOptions, MqttOptions, TlsOptions, Will};
pub use packets::{ConnectReturnCode, QoS};

/// Identifier carried by packets that take part in an acknowledgement
/// exchange. Zero is not a valid id on the wire.
pub type PacketId = core::num::NonZeroU16;

pub type Result<T> = std::result::Result<T, Error>;
