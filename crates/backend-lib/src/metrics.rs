// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_DISCONNECTION: &str = "ws.disconnection";
pub const WS_ACTIVE: &str = "ws.active";
pub const DIRECTORY_BOUND: &str = "directory.bound";
pub const MESSAGE_PERSISTED: &str = "message.persisted";
pub const DELIVERY_PUSHED: &str = "delivery.pushed";
pub const DELIVERY_PUSH_FAILED: &str = "delivery.push_failed";
pub const DELIVERY_OFFLINE: &str = "delivery.offline";
pub const DELIVERY_PERSIST_FAILED: &str = "delivery.persist_failed";
pub const DELIVERY_FANOUT_SIZE: &str = "delivery.fanout_size";
