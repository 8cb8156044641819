// Live broadcast tier
//
// Consumes `alerts.live` and fans each alert out to subscribed WebSocket
// dashboards, filtered by project. Slow consumers lose their oldest
// queued alerts rather than stalling the hub or being disconnected.

pub mod config;
pub mod consumer;
pub mod hub;
pub mod ws;

pub use config::LiveConfig;
pub use hub::{BroadcastHub, SubscriberQueue};
