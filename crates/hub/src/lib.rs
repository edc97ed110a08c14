// tessera-hub: real-time collaboration hub for workspace rooms, presence and
// frame locks.

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod hub;
pub mod membership;
pub mod metrics;
pub mod ws;
