//! PostgreSQL protocol interventions.

pub mod handshake;

pub use handshake::{
    is_ssl_request, HandshakeInterceptor, HandshakeOutcome, SSL_REFUSAL, SSL_REQUEST_CODE,
};
