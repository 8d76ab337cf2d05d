//! CRUD services over the config store, plus the tunnel runtime manager.

pub mod jumper;
pub mod tunnel;

pub use jumper::JumperService;
pub use tunnel::TunnelService;
