//! Gemini Live API client for Rust.
//!
//! This crate holds a live, bidirectional session with the Gemini Live
//! `BidiGenerateContent` websocket service: text and realtime audio go in,
//! text, audio and tool calls come back, and tool calls are answered while
//! the session keeps streaming.
//!
//! # Features
//!
//! - Typed wire codec for the setup, content, realtime and tool messages
//! - Session state machine with turn and interruption tracking
//! - Gap-free playback scheduling with barge-in
//! - Microphone capture with bounded backpressure
//! - Publish/subscribe events, as callbacks or as a stream
//! - In-memory transport for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use giztoy_gemini_live::{Channel, Client, Configuration, Event, Part};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::from_env()?;
//!     let session = client.session();
//!     let mut events = session.events_on(&[Channel::Content, Channel::TurnComplete]);
//!
//!     session
//!         .connect(Configuration::new("models/gemini-2.0-flash-exp"))
//!         .await?;
//!     session.send_text(vec![Part::text("Hello!")], true)?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             Event::Content(content) => print!("{}", content.text()),
//!             Event::TurnComplete => break,
//!             _ => {}
//!         }
//!     }
//!
//!     session.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod audio;
pub mod capture;
pub mod client;
pub mod error;
pub mod events;
pub mod message;
pub mod pipe;
pub mod playback;
pub mod session;
pub mod state;
pub mod tools;
pub mod transport;
pub mod types;

// Re-export main types
pub use audio::{AudioChunk, AudioFormat};
pub use capture::{AudioCapture, BackpressurePolicy, CaptureCounters, CaptureOptions, MediaSource};
pub use client::{Client, ClientBuilder};
pub use error::{Error, Result};
pub use events::{Channel, CloseInfo, CloseReason, Event, LogLevel, LogRecord, SubscriptionId};
pub use playback::{AudioSink, Clock};
pub use session::Session;
pub use state::{ModelTurn, SessionStatus};
pub use tools::InvocationStatus;
pub use types::*;
