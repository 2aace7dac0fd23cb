//! Core domain types for sessions, devices, and login anomaly scoring.
//!
//! Nothing in this crate performs I/O. Storage backends and the HTTP layer
//! build on these types and pure functions.

pub mod device;
pub mod geo;
pub mod session;
pub mod suspicion;
pub mod user;

pub use device::{parse_device, DeviceInfo, DeviceType};
pub use geo::{locate, GeoError, GeoLocator, GeoTable, Location};
pub use session::{
    NewSession, Session, SessionSummary, MAX_DEVICES_PER_USER, REFRESH_TOKEN_TTL_DAYS,
    SUSPICION_HISTORY_WINDOW,
};
pub use suspicion::{score, NoveltySignal, SuspicionVerdict};
pub use user::{has_permission, normalize_username, Permission, Role, User};
