//! EDGESec Supervisor
//!
//! Network-edge security supervisor: partitions Wi-Fi clients into
//! per-device VLANs, authenticates them over RADIUS, tracks their
//! addresses, programs netfilter for NAT and per-client bridging, and
//! schedules per-VLAN packet capture workers.

pub mod ap;
pub mod capture;
pub mod config;
pub mod crypt;
pub mod db;
pub mod dhcp;
pub mod metrics;
pub mod nft;
pub mod radius;
pub mod runtime;
pub mod sock;
pub mod state;
pub mod supervisor;
pub mod timers;

pub use config::Config;
pub use runtime::Runtime;
pub use supervisor::Supervisor;
