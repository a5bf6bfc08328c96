//! # Tessera Node
//!
//! The concurrency envelope around the Tessera consensus core.
//!
//! One [`Node`] owns the consensus state behind a single mutex and the
//! threads that drive it:
//!
//! - a dispatch thread applying inbound messages (consensus traffic before
//!   transactions) under the lock
//! - an optional baker thread running the slot loop
//! - a transaction-purge thread
//! - cancellable one-shot timer threads for the finalization replay and the
//!   Seen-buffer flush
//!
//! Network transport is an external collaborator: bytes come in through
//! [`Node::send_block`] and friends, bytes go out through the
//! [`OutboundSink`] the embedder provides. Outbound callbacks are never
//! invoked while the consensus lock is held.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tessera_node::{Node, SystemClock};
//!
//! let mut node = Node::new(
//!     &config,
//!     genesis,
//!     executor,
//!     Some(baker_credentials),
//!     Some(finalization_keys),
//!     transport,
//!     Arc::new(SystemClock),
//! )?;
//! node.start();
//! // feed bytes: node.send_block(peer, bytes);
//! node.stop();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

mod baker;
pub mod node;
pub mod timers;

pub use node::{InboundMessage, Node, NodeError, OutboundKind, OutboundSink, PeerId, SharedState};
pub use timers::{Clock, SystemClock, TimerHandle, TimerService};
