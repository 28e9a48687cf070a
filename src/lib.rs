//! Truck Relay Library
//!
//! Live video relay for a truck-detection station. One camera is read by a
//! single owner, frames are JPEG-compressed and fanned out to browser
//! clients over WebSockets, alongside a lower-rate channel of detection
//! metadata.
//!
//! # Architecture
//!
//! ```text
//! camera → source ──frames──→ fanout(video) → subscribers
//!            ↑                fanout(meta)  → subscribers
//!         control ←── server (HTTP/WS) ──→ registry ← reaper
//! ```
//!
//! - **Single device owner**: only the frame source touches the camera
//! - **Admission**: a connection receives nothing until it sends `"ping"`
//! - **Bounded delivery**: a stalled subscriber is dropped, never waited on
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use truck_relay::{
//!     capture::{Camera, CaptureConfig, MockCamera, RelayConfig, ServerConfig},
//!     relay::{Relay, StaticDetections},
//!     server::RelayServer,
//!     settings::MemorySettingsStore,
//! };
//!
//! # async fn run() -> truck_relay::Result<()> {
//! let relay = Relay::start(
//!     CaptureConfig::default(),
//!     RelayConfig::default(),
//!     Arc::new(MemorySettingsStore::default()),
//!     || Box::new(MockCamera::new()) as Box<dyn Camera>,
//!     Box::new(StaticDetections::default()),
//! )?;
//!
//! let server = RelayServer::new(ServerConfig::default(), relay.handle());
//! server.serve(relay.cancellation_token()).await?;
//! relay.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod capture;
pub mod control;
pub mod error;
pub mod metrics;
pub mod relay;
pub mod server;
pub mod settings;
pub mod source;

// Re-export commonly used types at crate root
pub use capture::{Camera, CaptureConfig, FileConfig, MockCamera, RelayConfig, ServerConfig};
pub use control::{ControlResponse, RelayControl};
pub use error::{Error, Result};
pub use relay::{ChannelKind, CloseReason, Relay, RelayHandle};
pub use server::RelayServer;
pub use settings::{MemorySettingsStore, SettingsStore, TomlSettingsStore};
pub use source::SourceState;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
