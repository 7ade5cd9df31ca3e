//! SASL mechanisms used during `connection.start` and `connection.secure`

use std::{fmt, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Error;

/// `ANONYMOUS` mechanism name
pub const ANONYMOUS: &str = "ANONYMOUS";
/// `PLAIN` mechanism name
pub const PLAIN: &str = "PLAIN";
/// `EXTERNAL` mechanism name
pub const EXTERNAL: &str = "EXTERNAL";

/// Credentials offered to the broker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslProfile {
    /// No credentials
    #[default]
    Anonymous,
    /// Username and password
    Plain {
        /// Username
        username: String,
        /// Password
        password: String,
    },
}

impl<'a> TryFrom<&'a Url> for SaslProfile {
    type Error = ();

    fn try_from(value: &'a Url) -> Result<Self, Self::Error> {
        match (value.username(), value.password()) {
            ("", _) | (_, None) => Err(()),
            (username, Some(password)) => Ok(SaslProfile::Plain {
                username: username.to_string(),
                password: password.to_string(),
            }),
        }
    }
}

/// One client side run of a mechanism
pub trait SaslClient: Send {
    /// Mechanism name sent in `connection.start-ok`
    fn mechanism(&self) -> &str;

    /// Response sent in `connection.start-ok`
    fn initial_response(&mut self) -> Result<Bytes, Error>;

    /// Response to a `connection.secure` challenge
    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Bytes, Error>;

    /// Whether the exchange is finished from the client's point of view
    fn is_complete(&self) -> bool;
}

/// Factory of [`SaslClient`]s for one mechanism
pub trait SaslMechanism: Send + Sync + 'static {
    /// Mechanism name as offered by brokers
    fn name(&self) -> &str;

    /// Whether the mechanism can run with the given credentials
    fn is_usable(&self, _profile: &SaslProfile) -> bool {
        true
    }

    /// Starts a new exchange
    fn client(&self, profile: &SaslProfile) -> Result<Box<dyn SaslClient>, Error>;
}

/// Mechanisms available to connections, in order of preference
///
/// Owned by a [`ConnectionFactory`](crate::ConnectionFactory) and shared by
/// every connection it creates.
#[derive(Clone)]
pub struct SaslRegistry {
    mechanisms: Vec<Arc<dyn SaslMechanism>>,
}

impl fmt::Debug for SaslRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.mechanisms.iter().map(|m| m.name()))
            .finish()
    }
}

impl Default for SaslRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl SaslRegistry {
    /// A registry without any mechanism
    pub fn empty() -> Self {
        Self {
            mechanisms: Vec::new(),
        }
    }

    /// `PLAIN`, `ANONYMOUS` and `EXTERNAL`, in that order
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Plain);
        registry.register(Anonymous);
        registry.register(External);
        registry
    }

    /// Adds a mechanism with lower preference than those already present.
    /// A mechanism with the same name is replaced in place.
    pub fn register(&mut self, mechanism: impl SaslMechanism) {
        let mechanism: Arc<dyn SaslMechanism> = Arc::new(mechanism);
        match self
            .mechanisms
            .iter_mut()
            .find(|m| m.name() == mechanism.name())
        {
            Some(existing) => *existing = mechanism,
            None => self.mechanisms.push(mechanism),
        }
    }

    /// Names of the registered mechanisms
    pub fn names(&self) -> Vec<&str> {
        self.mechanisms.iter().map(|m| m.name()).collect()
    }

    /// Picks the most preferred mechanism that the broker offers, that the
    /// restriction allows and that can run with `profile`
    ///
    /// `offered` is the space separated list from `connection.start`.
    pub fn select(
        &self,
        offered: &str,
        restriction: Option<&[String]>,
        profile: &SaslProfile,
    ) -> Option<Arc<dyn SaslMechanism>> {
        let offered: Vec<&str> = offered.split_whitespace().collect();
        self.mechanisms
            .iter()
            .filter(|m| offered.contains(&m.name()))
            .filter(|m| match restriction {
                Some(allowed) => allowed.iter().any(|a| a == m.name()),
                None => true,
            })
            .find(|m| m.is_usable(profile))
            .cloned()
    }
}

/* ---------------------------------- PLAIN --------------------------------- */

/// `PLAIN`: `\0username\0password`
#[derive(Debug, Clone, Copy)]
pub struct Plain;

impl SaslMechanism for Plain {
    fn name(&self) -> &str {
        PLAIN
    }

    fn is_usable(&self, profile: &SaslProfile) -> bool {
        matches!(profile, SaslProfile::Plain { .. })
    }

    fn client(&self, profile: &SaslProfile) -> Result<Box<dyn SaslClient>, Error> {
        match profile {
            SaslProfile::Plain { username, password } => Ok(Box::new(PlainClient {
                username: username.clone(),
                password: password.clone(),
                complete: false,
            })),
            SaslProfile::Anonymous => Err(Error::AuthenticationFailure(
                "PLAIN requires a username and password".into(),
            )),
        }
    }
}

struct PlainClient {
    username: String,
    password: String,
    complete: bool,
}

impl SaslClient for PlainClient {
    fn mechanism(&self) -> &str {
        PLAIN
    }

    fn initial_response(&mut self) -> Result<Bytes, Error> {
        let username = self.username.as_bytes();
        let password = self.password.as_bytes();
        let mut buf = BytesMut::with_capacity(username.len() + password.len() + 2);
        buf.put_u8(0);
        buf.put_slice(username);
        buf.put_u8(0);
        buf.put_slice(password);
        self.complete = true;
        Ok(buf.freeze())
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Bytes, Error> {
        Err(Error::AuthenticationFailure(
            "unexpected challenge for PLAIN".into(),
        ))
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

/* -------------------------------- ANONYMOUS ------------------------------- */

/// `ANONYMOUS`: empty response
#[derive(Debug, Clone, Copy)]
pub struct Anonymous;

impl SaslMechanism for Anonymous {
    fn name(&self) -> &str {
        ANONYMOUS
    }

    fn client(&self, _profile: &SaslProfile) -> Result<Box<dyn SaslClient>, Error> {
        Ok(Box::new(EmptyResponseClient {
            mechanism: ANONYMOUS,
        }))
    }
}

/* -------------------------------- EXTERNAL -------------------------------- */

/// `EXTERNAL`: identity comes from the transport, response is empty
#[derive(Debug, Clone, Copy)]
pub struct External;

impl SaslMechanism for External {
    fn name(&self) -> &str {
        EXTERNAL
    }

    fn client(&self, _profile: &SaslProfile) -> Result<Box<dyn SaslClient>, Error> {
        Ok(Box::new(EmptyResponseClient {
            mechanism: EXTERNAL,
        }))
    }
}

struct EmptyResponseClient {
    mechanism: &'static str,
}

impl SaslClient for EmptyResponseClient {
    fn mechanism(&self) -> &str {
        self.mechanism
    }

    fn initial_response(&mut self) -> Result<Bytes, Error> {
        Ok(Bytes::new())
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Bytes, Error> {
        Ok(Bytes::new())
    }

    fn is_complete(&self) -> bool {
        true
    }
}
