//! EDGESec Capture Worker
//!
//! Per-VLAN packet capture child of the supervisor: captures on one
//! interface, decodes frames, persists packet metadata to the shared
//! SQLite `pcap` table and reports DHCP/DNS/mDNS device fingerprints back
//! through the supervisor's command socket.

pub mod decode;
pub mod filter;
pub mod meta;
pub mod report;
pub mod sniffer;

pub use filter::FrameFilter;
pub use meta::{MetaWriter, PacketRecord};
pub use report::FingerprintReporter;
pub use sniffer::Sniffer;
