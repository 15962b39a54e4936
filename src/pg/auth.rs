//! Startup handshake state machine.
//!
//! ```text
//! AwaitingAuthRequest ─ Ok ─────────────────────────────► AwaitingBackendKeyData
//!        │  ▲   Cleartext / MD5: send password, wait again        │
//!        │  └──────────────────────────────┐                      ▼
//!        └─ SASL ─► SaslContinue ─► SaslFinal ─ verified ─┘   AwaitingReady ─► Ready
//! ```
//!
//! The machine is driven only by server messages and writes its replies into
//! the connection's [`MessageWriter`]. Any unexpected request or unsupported
//! method is returned as [`Error::Auth`], which the driver treats as fatal.

use super::codec::MessageWriter;
use super::protocol::{self, AuthRequest, SCRAM_SHA_256};
use super::scram::ScramClient;
use crate::error::{Error, Result};

enum State {
    AwaitingAuthRequest,
    /// Client-first sent, waiting for the server-first message.
    SaslContinue(Box<ScramClient>),
    /// Client-final sent, waiting for the server signature.
    SaslFinal(Box<ScramClient>),
    AwaitingBackendKeyData,
    AwaitingReady,
    Ready,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::AwaitingAuthRequest => "AwaitingAuthRequest",
            State::SaslContinue(_) => "SaslContinue",
            State::SaslFinal(_) => "SaslFinal",
            State::AwaitingBackendKeyData => "AwaitingBackendKeyData",
            State::AwaitingReady => "AwaitingReady",
            State::Ready => "Ready",
        }
    }
}

pub struct Authenticator {
    user: String,
    password: Option<String>,
    state: State,
}

impl Authenticator {
    pub fn new(user: &str, password: Option<&str>) -> Self {
        Self {
            user: user.to_string(),
            password: password.map(str::to_string),
            state: State::AwaitingAuthRequest,
        }
    }

    fn password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| Error::Auth("Server requested a password but none was configured".to_string()))
    }

    /// Handle one `Authentication*` message.
    pub fn on_request(&mut self, request: AuthRequest, w: &mut MessageWriter) -> Result<()> {
        let state = std::mem::replace(&mut self.state, State::AwaitingAuthRequest);

        self.state = match (state, request) {
            (State::AwaitingAuthRequest, AuthRequest::Ok) => State::AwaitingBackendKeyData,
            (State::AwaitingAuthRequest, AuthRequest::CleartextPassword) => {
                protocol::password(w, self.password()?);
                State::AwaitingAuthRequest
            }
            (State::AwaitingAuthRequest, AuthRequest::Md5Password { salt }) => {
                let hash = md5_password(&self.user, self.password()?, &salt);
                protocol::password(w, &hash);
                State::AwaitingAuthRequest
            }
            (State::AwaitingAuthRequest, AuthRequest::Sasl { mechanisms }) => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(Error::Auth(format!(
                        "Server requires unsupported SASL mechanisms: {:?}",
                        mechanisms
                    )));
                }
                let scram = ScramClient::new(&self.user, self.password()?);
                protocol::sasl_initial_response(w, SCRAM_SHA_256, &scram.client_first_message());
                State::SaslContinue(Box::new(scram))
            }
            (State::SaslContinue(mut scram), AuthRequest::SaslContinue { data }) => {
                let client_final = scram
                    .process_server_first(&data)
                    .map_err(|e| Error::Auth(e.to_string()))?;
                protocol::sasl_response(w, &client_final);
                State::SaslFinal(scram)
            }
            (State::SaslFinal(scram), AuthRequest::SaslFinal { data }) => {
                scram
                    .verify_server_final(&data)
                    .map_err(|e| Error::Auth(e.to_string()))?;
                // AuthenticationOk follows
                State::AwaitingAuthRequest
            }
            (_, AuthRequest::Unsupported(code)) => {
                return Err(Error::Auth(format!(
                    "Unsupported authentication method (code {})",
                    code
                )));
            }
            (state, request) => {
                return Err(Error::Auth(format!(
                    "Unexpected authentication message {:?} in state {}",
                    request,
                    state.name()
                )));
            }
        };
        Ok(())
    }

    /// BackendKeyData arrived.
    pub fn on_backend_key(&mut self) -> Result<()> {
        match self.state {
            State::AwaitingBackendKeyData => {
                self.state = State::AwaitingReady;
                Ok(())
            }
            _ => Err(Error::Protocol(format!(
                "Unexpected BackendKeyData in state {}",
                self.state.name()
            ))),
        }
    }

    /// First ReadyForQuery arrived. Servers may skip BackendKeyData.
    pub fn on_ready(&mut self) -> Result<()> {
        match self.state {
            State::AwaitingBackendKeyData | State::AwaitingReady => {
                self.state = State::Ready;
                Ok(())
            }
            _ => Err(Error::Protocol(format!(
                "Unexpected ReadyForQuery in state {}",
                self.state.name()
            ))),
        }
    }
}

/// `"md5" + md5(md5(password + user) + salt)`, hex encoded.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let mut outer_input = format!("{:x}", inner).into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer_input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::codec::{Cursor, FrameBuffer};
    use bytes::Bytes;

    fn sent(w: &mut MessageWriter) -> (u8, Bytes) {
        let mut reader = FrameBuffer::new();
        reader.extend(&w.take());
        reader.next_frame().unwrap().unwrap()
    }

    #[test]
    fn test_md5_password() {
        assert_eq!(
            md5_password("bob", "secret", &[1, 2, 3, 4]),
            "md5f21dfe33ff3a9e03dbc3e008251fe5cc"
        );
    }

    #[test]
    fn test_md5_flow() {
        let mut auth = Authenticator::new("bob", Some("secret"));
        let mut w = MessageWriter::new();

        auth.on_request(AuthRequest::Md5Password { salt: [1, 2, 3, 4] }, &mut w)
            .unwrap();
        let (tag, body) = sent(&mut w);
        assert_eq!(tag, b'p');
        assert_eq!(
            Cursor::new(body).cstr().unwrap(),
            "md5f21dfe33ff3a9e03dbc3e008251fe5cc"
        );

        auth.on_request(AuthRequest::Ok, &mut w).unwrap();
        auth.on_backend_key().unwrap();
        assert!(!matches!(auth.state, State::Ready));
        auth.on_ready().unwrap();
        assert!(matches!(auth.state, State::Ready));
    }

    #[test]
    fn test_trust_without_backend_key() {
        let mut auth = Authenticator::new("bob", None);
        let mut w = MessageWriter::new();
        auth.on_request(AuthRequest::Ok, &mut w).unwrap();
        assert!(w.is_empty());
        auth.on_ready().unwrap();
        assert!(matches!(auth.state, State::Ready));
    }

    #[test]
    fn test_sasl_starts_with_scram() {
        let mut auth = Authenticator::new("bob", Some("pw"));
        let mut w = MessageWriter::new();
        auth.on_request(
            AuthRequest::Sasl {
                mechanisms: vec!["SCRAM-SHA-256".to_string()],
            },
            &mut w,
        )
        .unwrap();

        let (tag, body) = sent(&mut w);
        assert_eq!(tag, b'p');
        let mut c = Cursor::new(body);
        assert_eq!(c.cstr().unwrap(), "SCRAM-SHA-256");
        let len = c.i32().unwrap() as usize;
        let first = c.bytes(len).unwrap();
        assert!(first.starts_with(b"n,,n=bob,r="));

        // A SASLFinal before SASLContinue is out of order
        let err = auth
            .on_request(AuthRequest::SaslFinal { data: Bytes::new() }, &mut w)
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn test_fatal_paths() {
        let mut w = MessageWriter::new();

        let mut auth = Authenticator::new("bob", Some("pw"));
        let err = auth
            .on_request(
                AuthRequest::Sasl {
                    mechanisms: vec!["SCRAM-SHA-256-PLUS".to_string()],
                },
                &mut w,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));

        let mut auth = Authenticator::new("bob", Some("pw"));
        let err = auth.on_request(AuthRequest::Unsupported(7), &mut w).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));

        let mut auth = Authenticator::new("bob", None);
        let err = auth
            .on_request(AuthRequest::CleartextPassword, &mut w)
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));

        let mut auth = Authenticator::new("bob", None);
        assert!(auth.on_ready().is_err());
    }
}
