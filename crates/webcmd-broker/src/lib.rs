//! Connection-and-correlation broker.
//!
//! Provides:
//! - `Broker` / `BrokerHandle` - the owning tasks and their client handle
//! - `ResultHandle` - the caller side of one pending request
//!
//! Internally a registry maps node identities to per-connection pumps, and a
//! correlation table matches results and deadlines to pending requests.

mod broker;
mod config;
mod correlation;
mod error;
mod pump;
mod registry;

pub use broker::{Broker, BrokerHandle};
pub use config::BrokerConfig;
pub use correlation::ResultHandle;
pub use error::{BrokerError, CommandError, TransportError};
pub use pump::ConnId;
