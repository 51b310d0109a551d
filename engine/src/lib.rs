//! Burrow engine: the data plane of a host-local DNS-filtering gateway.
//!
//! The engine owns a tunnel file descriptor obtained from the host VPN
//! facility and a single upstream UDP socket. DNS queries read from the
//! tunnel are matched against an immutable rule table: denied names get a
//! synthesized NXDOMAIN, everything else is forwarded to an upstream
//! resolver and the response is reframed back to the originating client.
//! Non-DNS traffic is sunk.

mod blocklog;
mod config;
mod dns;
mod engine;
mod error;
mod packet;
mod pump;
mod rules;
mod status;
mod tracker;
mod tun;
mod upstream;

pub use blocklog::{BlockLog, BlockLogEntry};
pub use config::{
    should_autostart, AppDefaultMode, AppInclusion, Config, HostSource, UpstreamConfig, UserRule,
};
pub use engine::{Command, Engine, EngineOptions};
pub use error::EngineError;
pub use rules::{Disposition, RuleTable, RuleTableBuilder};
pub use status::{EngineState, Status, StatusReporter};
pub use tun::{TunBuilder, TunOptions, GATEWAY_V4, GATEWAY_V6, TUNNEL_MTU};
pub use upstream::Resolver;
