//! Non-blocking TLS transport over rustls.
//!
//! The service loop sees the OpenSSL-style contract the engine is built
//! around: reads and writes either make progress or report which readiness
//! they are waiting for. Fatal conditions are errors, never statuses.

use crate::error::Error;
use crate::options::TlsOptions;
use mio::net::TcpStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Bound on plaintext and ciphertext rustls may buffer internally.
const TLS_BUFFER_LIMIT: usize = 1024 * 1024;

/// Outcome of a non-blocking TLS read or write.
#[derive(Debug, PartialEq, Eq)]
pub enum TlsStatus {
	/// This many bytes were transferred.
	Progress(usize),
	/// No progress until the socket is readable.
	WantRead,
	/// No progress until the socket is writable.
	WantWrite,
}

/// One TLS session bound to one non-blocking TCP stream.
pub struct TlsStream {
	conn: ClientConnection,
	sock: TcpStream,
	/// Decrypted bytes buffered inside rustls, not yet handed out.
	pending_plaintext: usize,
}

impl TlsStream {
	pub fn new(config: Arc<ClientConfig>, host: &str, sock: TcpStream) -> Result<Self, Error> {
		let server_name = ServerName::try_from(host.to_string())
			.map_err(|_| Error::Param("host is not a valid tls server name"))?;

		let mut conn = ClientConnection::new(config, server_name)?;
		conn.set_buffer_limit(Some(TLS_BUFFER_LIMIT));

		Ok(Self {
			conn,
			sock,
			pending_plaintext: 0,
		})
	}

	pub fn socket_mut(&mut self) -> &mut TcpStream {
		&mut self.sock
	}

	pub fn wants_write(&self) -> bool {
		self.conn.wants_write()
	}

	/// Decrypted bytes are waiting inside the session; the caller must not
	/// block in poll while this is true.
	pub fn pending_plaintext(&self) -> bool {
		self.pending_plaintext > 0
	}

	/// Reads decrypted bytes into `dst`, pulling ciphertext off the socket
	/// and driving the handshake as needed.
	pub fn read_into(&mut self, dst: &mut [u8]) -> Result<TlsStatus, Error> {
		loop {
			// Hand out whatever is already decrypted.
			match self.conn.reader().read(dst) {
				Ok(0) => {
					tracing::debug!("tls session closed by peer");
					return Err(Error::ConnectionDropped);
				}
				Ok(count) => {
					self.pending_plaintext = self.pending_plaintext.saturating_sub(count);
					return Ok(TlsStatus::Progress(count));
				}
				Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
				Err(error) => {
					tracing::error!(%error, "tls read failed");
					return Err(Error::ConnectionDropped);
				}
			}

			// Pull more ciphertext off the wire.
			if self.conn.wants_read() {
				match self.conn.read_tls(&mut self.sock) {
					Ok(0) => {
						tracing::debug!("connection closed by peer");
						return Err(Error::ConnectionDropped);
					}
					Ok(_) => {
						let state = self.conn.process_new_packets().map_err(|error| {
							tracing::error!(%error, "tls processing failed");
							Error::ConnectionDropped
						})?;
						self.pending_plaintext = state.plaintext_bytes_to_read();
						continue;
					}
					Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
					Err(error) => {
						tracing::debug!(%error, "socket read failed");
						return Err(Error::ConnectionDropped);
					}
				}
			}

			// The handshake may need to speak before more data arrives.
			return match self.flush()? {
				true => Ok(TlsStatus::WantRead),
				false => Ok(TlsStatus::WantWrite),
			};
		}
	}

	/// Writes plaintext from `src`, flushing as much resulting ciphertext to
	/// the socket as it will take. An empty `src` flushes only.
	pub fn write_from(&mut self, src: &[u8]) -> Result<TlsStatus, Error> {
		let mut retried = false;
		loop {
			let mut accepted = 0;
			if !src.is_empty() {
				accepted = self.conn.writer().write(src).map_err(|error| {
					tracing::error!(%error, "tls write failed");
					Error::ConnectionDropped
				})?;
			}

			if !self.flush()? {
				// Socket is full; ciphertext remains queued inside rustls.
				return Ok(if accepted > 0 {
					TlsStatus::Progress(accepted)
				} else {
					TlsStatus::WantWrite
				});
			}

			if accepted == 0 && !src.is_empty() {
				if self.conn.is_handshaking() {
					// Nothing flows until the peer answers the handshake.
					return Ok(TlsStatus::WantRead);
				}
				if !retried {
					// The session buffer was full and has just been flushed.
					retried = true;
					continue;
				}
				return Ok(TlsStatus::WantWrite);
			}

			return Ok(TlsStatus::Progress(accepted));
		}
	}

	/// Moves queued ciphertext to the socket. Returns `false` when the
	/// socket would block with data still queued.
	fn flush(&mut self) -> Result<bool, Error> {
		while self.conn.wants_write() {
			match self.conn.write_tls(&mut self.sock) {
				Ok(0) => {
					tracing::debug!("connection closed by peer");
					return Err(Error::ConnectionDropped);
				}
				Ok(_) => {}
				Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(false),
				Err(error) => {
					tracing::debug!(%error, "socket write failed");
					return Err(Error::ConnectionDropped);
				}
			}
		}
		Ok(true)
	}
}

/// Builds the per-connection rustls configuration.
///
/// Verification runs against the bundled `webpki-roots` anchors unless the
/// caller explicitly opted out.
pub fn client_config(options: &TlsOptions) -> Arc<ClientConfig> {
	let config = if options.danger_accept_invalid_certs {
		tracing::warn!("server certificate verification is disabled");
		ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoVerification))
			.with_no_client_auth()
	} else {
		let mut roots = RootCertStore::empty();
		roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
		ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth()
	};

	Arc::new(config)
}

/// Accepts any server certificate. Installed only on explicit opt-out.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		vec![
			SignatureScheme::RSA_PKCS1_SHA256,
			SignatureScheme::RSA_PKCS1_SHA384,
			SignatureScheme::RSA_PKCS1_SHA512,
			SignatureScheme::RSA_PSS_SHA256,
			SignatureScheme::RSA_PSS_SHA384,
			SignatureScheme::RSA_PSS_SHA512,
			SignatureScheme::ECDSA_NISTP256_SHA256,
			SignatureScheme::ECDSA_NISTP384_SHA384,
			SignatureScheme::ECDSA_NISTP521_SHA512,
			SignatureScheme::ED25519,
		]
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::options::TlsOptions;

	#[test]
	fn builds_verifying_config_by_default() {
		let config = client_config(&TlsOptions::default());
		// The verifying configuration carries the webpki trust anchors.
		assert!(Arc::strong_count(&config) >= 1);
	}

	#[test]
	fn builds_permissive_config_on_opt_out() {
		let _ = client_config(&TlsOptions {
			danger_accept_invalid_certs: true,
		});
	}

	#[test]
	fn no_verification_lists_schemes() {
		assert!(!NoVerification.supported_verify_schemes().is_empty());
	}
}
