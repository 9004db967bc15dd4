// Client connection engine for the courier publish/subscribe protocol.
// Speaks the line-oriented text protocol over TCP or TLS to a cluster of
// servers and keeps the connection alive across server loss.
//
// IMPORTANT CLIENT-SIDE DESIGN INTENT
// ----------------------------------
// Application calls never touch the socket. Publishing, subscribing and
// unsubscribing only append encoded bytes to one locked outbound buffer; a
// single flusher task per transport owns the write half and drains that
// buffer in whole batches. The read half is owned by the supervisor task,
// which decodes server ops and dispatches them without ever blocking:
//
// - Each subscription has its own queue, policed by pending limits. A slow
//   consumer loses messages, it never stalls the read loop or its siblings.
// - Requests share one wildcard inbox and are correlated by token.
// - When the transport fails, publishes move into a bounded reconnect buffer
//   and are replayed, in order, after the subscriptions are re-established on
//   the next server.
//
// Delivery is at-most-once. Bytes handed to a socket that then dies are gone;
// `flush` is the way to learn that the server has seen everything so far.
pub mod auth;
pub mod client;
pub mod config;
pub mod counters;
pub mod error;
pub mod message;
pub mod nuid;
pub mod server_pool;
mod wire;

pub use auth::{Signer, build_connect_info};
pub use client::client::{Client, ConnectionState};
pub use client::event_router::ClientEvent;
pub use client::subscription::{Subscription, SubscriptionMode};
pub use config::Options;
pub use counters::StatisticsSnapshot;
pub use courier_transport::{ServerAddr, TlsOptions};
pub use courier_wire::{HeaderMap, ServerInfo, StatusCode};
pub use error::{Error, Result};
pub use message::Message;
pub use nuid::{IdGenerator, Nuid};
pub use server_pool::{PoolEntry, ReconnectDelay, ServerPool};

#[cfg(test)]
mod tests;
