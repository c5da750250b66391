//! SSL negotiation interception.
//!
//! A PostgreSQL client that wants TLS opens with an 8-byte `SSLRequest`:
//! a big-endian length of 8 followed by the code `80877103`. Answering `N`
//! tells the client the server does not do TLS, and a compliant client
//! continues with its startup message in clear text. The request never
//! reaches the backend.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::Result;
use crate::network::relay::{read_some, send_all};

/// Negotiation code of an `SSLRequest` (`1234 << 16 | 5679`).
pub const SSL_REQUEST_CODE: u32 = 0x04D2_162F;

/// Length field of an `SSLRequest`, which counts itself.
pub const SSL_REQUEST_LEN: u32 = 8;

/// Single-byte answer refusing TLS.
pub const SSL_REFUSAL: u8 = b'N';

/// Whether `bytes` is exactly one `SSLRequest`.
#[must_use]
pub fn is_ssl_request(bytes: &[u8]) -> bool {
    let Ok(message) = <[u8; 8]>::try_from(bytes) else {
        return false;
    };
    let length = u32::from_be_bytes([message[0], message[1], message[2], message[3]]);
    let code = u32::from_be_bytes([message[4], message[5], message[6], message[7]]);
    length == SSL_REQUEST_LEN && code == SSL_REQUEST_CODE
}

/// What the first read from a new client turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// An `SSLRequest` was answered with a refusal.
    Refused,
    /// Ordinary client bytes; they still have to reach the backend.
    Passthrough(Bytes),
    /// The client closed before sending anything.
    ///
    /// The caller skips the backend connect, so no pair is ever opened; a
    /// failed first read is returned as an error with the same effect.
    Closed,
}

/// Peeks at the first client bytes and refuses TLS negotiation.
#[derive(Debug, Clone)]
pub struct HandshakeInterceptor {
    buffer_size: usize,
    idle_timeout: Option<Duration>,
}

impl HandshakeInterceptor {
    /// Create an interceptor reading at most `buffer_size` bytes.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            idle_timeout: None,
        }
    }

    /// Bound the wait for the first bytes.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Read once from the client and answer an `SSLRequest` if that is
    /// what arrived.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or times out, or if the refusal
    /// byte cannot be sent.
    pub async fn intercept<S>(&self, client: &mut S) -> Result<HandshakeOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];
        let n = read_some(client, &mut buf, self.idle_timeout, "client").await?;

        if n == 0 {
            debug!("client closed before sending a startup message");
            return Ok(HandshakeOutcome::Closed);
        }

        if is_ssl_request(&buf[..n]) {
            send_all(client, &[SSL_REFUSAL], "client").await?;
            debug!("SSLRequest refused, client continues in clear text");
            return Ok(HandshakeOutcome::Refused);
        }

        buf.truncate(n);
        Ok(HandshakeOutcome::Passthrough(Bytes::from(buf)))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;

    const SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xD2, 0x16, 0x2F];

    #[test]
    fn test_ssl_request_detection() {
        assert!(is_ssl_request(&SSL_REQUEST));
        assert_eq!(SSL_REQUEST_CODE, 80_877_103);
    }

    #[test]
    fn test_near_misses_are_not_ssl_requests() {
        // GSSENCRequest
        assert!(!is_ssl_request(&[0, 0, 0, 8, 0x04, 0xD2, 0x16, 0x30]));
        // Wrong length field
        assert!(!is_ssl_request(&[0, 0, 0, 9, 0x04, 0xD2, 0x16, 0x2F]));
        // Truncated
        assert!(!is_ssl_request(&SSL_REQUEST[..7]));
        // Followed by more bytes
        let mut longer = SSL_REQUEST.to_vec();
        longer.push(0);
        assert!(!is_ssl_request(&longer));
        assert!(!is_ssl_request(&[]));
    }

    #[tokio::test]
    async fn test_ssl_request_is_refused_with_single_byte() {
        let (mut client, mut proxy_side) = duplex(64);
        client.write_all(&SSL_REQUEST).await.unwrap();

        let outcome = HandshakeInterceptor::new(1024)
            .intercept(&mut proxy_side)
            .await
            .unwrap();
        assert_eq!(outcome, HandshakeOutcome::Refused);

        drop(proxy_side);
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![b'N']);
    }

    #[tokio::test]
    async fn test_startup_message_passes_through_without_refusal() {
        let (mut client, mut proxy_side) = duplex(256);
        let mut startup = vec![0, 0, 0, 41, 0, 3, 0, 0];
        startup.extend_from_slice(b"user\0postgres\0database\0app\0\0");
        client.write_all(&startup).await.unwrap();

        let outcome = HandshakeInterceptor::new(1024)
            .intercept(&mut proxy_side)
            .await
            .unwrap();
        assert_eq!(outcome, HandshakeOutcome::Passthrough(Bytes::from(startup)));

        drop(proxy_side);
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_closed_client_is_reported() {
        let (client, mut proxy_side) = duplex(64);
        drop(client);

        let outcome = HandshakeInterceptor::new(64)
            .intercept(&mut proxy_side)
            .await
            .unwrap();
        assert_eq!(outcome, HandshakeOutcome::Closed);
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let (_client, mut proxy_side) = duplex(64);

        let result = HandshakeInterceptor::new(64)
            .with_idle_timeout(Some(Duration::from_millis(20)))
            .intercept(&mut proxy_side)
            .await;
        assert!(result.is_err());
    }
}
