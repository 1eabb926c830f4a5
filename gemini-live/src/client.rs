//! Client for the Gemini Live API.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::playback::{AudioSink, Clock, NullSink, SystemClock};
use crate::session::Session;
use crate::transport::{DEFAULT_WEBSOCKET_URL, Dialer, Endpoint, WebSocketDialer};
use crate::types::Configuration;

/// Environment variable holding the API key.
pub const ENV_API_KEY: &str = "GEMINI_API_KEY";
/// Fallback environment variable for the API key.
pub const ENV_GOOGLE_API_KEY: &str = "GOOGLE_API_KEY";
/// Environment variable overriding the websocket URL.
pub const ENV_URL: &str = "GEMINI_LIVE_URL";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings shared by a client and its session.
pub(crate) struct ClientSettings {
    pub endpoint: Endpoint,
    pub dialer: Arc<dyn Dialer>,
    pub connect_timeout: Duration,
    pub setup_timeout: Duration,
    pub outbound_delay: Duration,
    pub playback_lead: Duration,
    pub clock: Arc<dyn Clock>,
}

/// Gemini Live API client.
///
/// A client owns exactly one [`Session`]; [`Client::session`] hands out
/// clones of it.
pub struct Client {
    session: Session,
}

impl Client {
    /// Creates a client with default settings.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        ClientBuilder::new(api_key).build()
    }

    /// Starts a builder.
    pub fn builder(api_key: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(api_key)
    }

    /// Creates a client from `GEMINI_API_KEY` (or `GOOGLE_API_KEY`) and the
    /// optional `GEMINI_LIVE_URL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var(ENV_API_KEY)
            .or_else(|_| std::env::var(ENV_GOOGLE_API_KEY))
            .map_err(|_| {
                Error::InvalidConfig(format!("{} is not set", ENV_API_KEY))
            })?;
        let mut builder = ClientBuilder::new(api_key);
        if let Ok(url) = std::env::var(ENV_URL) {
            builder = builder.websocket_url(url);
        }
        builder.build()
    }

    /// Returns the client's session.
    pub fn session(&self) -> Session {
        self.session.clone()
    }

    /// Connects the session with `config`.
    pub async fn connect(&self, config: Configuration) -> Result<Session> {
        self.session.connect(config).await?;
        Ok(self.session.clone())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session)
            .finish()
    }
}

/// Builder for creating a Client with options.
pub struct ClientBuilder {
    api_key: String,
    ws_url: Option<String>,
    dialer: Option<Arc<dyn Dialer>>,
    connect_timeout: Duration,
    setup_timeout: Duration,
    outbound_delay: Duration,
    playback_lead: Duration,
    audio_sink: Option<Box<dyn AudioSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ClientBuilder {
    /// Creates a new client builder.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ws_url: None,
            dialer: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            outbound_delay: Duration::ZERO,
            playback_lead: Duration::ZERO,
            audio_sink: None,
            clock: None,
        }
    }

    /// Sets the WebSocket URL.
    pub fn websocket_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    /// Replaces the websocket dialer, e.g. with [`crate::pipe`].
    pub fn dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Some(Arc::new(dialer));
        self
    }

    /// Bounds the transport handshake.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bounds the wait for `setupComplete`.
    pub fn setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    /// Holds each outbound frame for `delay` before writing it.
    pub fn outbound_delay(mut self, delay: Duration) -> Self {
        self.outbound_delay = delay;
        self
    }

    /// Delays the first audio chunk after silence by `lead`.
    pub fn playback_lead(mut self, lead: Duration) -> Self {
        self.playback_lead = lead;
        self
    }

    /// Sets where model audio is played.
    pub fn audio_sink(mut self, sink: impl AudioSink + 'static) -> Self {
        self.audio_sink = Some(Box::new(sink));
        self
    }

    /// Sets the playback clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the client.
    pub fn build(self) -> Result<Client> {
        if self.api_key.is_empty() {
            return Err(Error::InvalidConfig("API key is required".to_string()));
        }

        let endpoint = Endpoint {
            url: self
                .ws_url
                .unwrap_or_else(|| DEFAULT_WEBSOCKET_URL.to_string()),
            api_key: self.api_key,
        };
        endpoint.authorized_url()?;

        let settings = Arc::new(ClientSettings {
            endpoint,
            dialer: self.dialer.unwrap_or_else(|| Arc::new(WebSocketDialer)),
            connect_timeout: self.connect_timeout,
            setup_timeout: self.setup_timeout,
            outbound_delay: self.outbound_delay,
            playback_lead: self.playback_lead,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
        });
        let sink = self.audio_sink.unwrap_or_else(|| Box::new(NullSink));

        Ok(Client {
            session: Session::new(settings, sink),
        })
    }
}
