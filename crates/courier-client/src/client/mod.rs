// Client-side modules for the connection, subscriptions, requests and events.
#![allow(clippy::module_inception)]
pub mod client;
pub(crate) mod connection;
pub mod event_router;
pub(crate) mod outbound;
pub(crate) mod reconnect;
pub(crate) mod request;
pub mod subscription;
