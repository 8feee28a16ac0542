//! # natnet - Rust client for NatNet-style rigid-body streaming
//!
//! Connects to a motion-capture server and keeps the latest rigid-body poses
//! available to any number of reader threads. Provides:
//! - Server discovery and version handshake over the command channel
//! - A background receiver thread decoding data frames
//! - Lock-free access to the latest frame, with staleness tracking
//!
//! ## Quick Start
//! ```no_run
//! use natnet::Client;
//! use std::time::Duration;
//!
//! let mut client = Client::new();
//! client.connect(None, None).unwrap();
//!
//! for _ in 0..100 {
//!     for rb in client.get_rigid_bodies() {
//!         println!("RB {} pos {:?} quat {:?}", rb.id, rb.position, rb.orientation);
//!     }
//!     std::thread::sleep(Duration::from_millis(100));
//! }
//! client.disconnect();
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod protocol;
pub mod transport;
pub mod store;
pub mod receiver;
pub mod client;

pub use error::{status_code, ConnectError, DecodeError, EncodeError, RecvError};
pub use types::*;
pub use config::ClientConfig;
pub use client::Client;
pub use receiver::ReceiverStats;
pub use transport::{Session, Transport};

/// Result type alias for connect operations.
pub type Result<T> = std::result::Result<T, ConnectError>;
