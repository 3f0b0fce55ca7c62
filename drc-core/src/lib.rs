// ABOUTME: Coordination substrate shared by the drc bridge daemons
// ABOUTME: Envelope codec, broker, router, correlations, identity tracking and ordering governors

pub mod broker;
pub mod bus;
pub mod config;
pub mod correlation;
pub mod envelope;
pub mod governor;
pub mod identity;
pub mod metrics;
pub mod paths;
pub mod roster;
pub mod router;

pub use broker::{serve_broker, Broker, Delivery, MemoryBroker, Subscription, TcpBroker};
pub use bus::Bus;
pub use config::Config;
pub use correlation::{CorrelationRegistry, Discriminator, Ticket};
pub use envelope::{decode, encode, DecodeError, Envelope, EventKind, Tag, TagError};
pub use governor::{FloodGovernor, FloodReport, SerialQueue};
pub use identity::{ChannelIdentitySet, NickIdentity};
pub use roster::{RosterError, RosterService};
pub use router::{BusRouter, Handler, Routed};
