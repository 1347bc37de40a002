//! basalt-driver — client driver for the Basalt distributed database.
//!
//! The driver multiplexes many concurrent requests over a small number
//! of connections per host. A caller thread hands a request to the
//! [`Session`]; the load-balancing policy produces a query plan; the
//! first host whose pool accepts the request carries it on a leased
//! stream slot; the reactor threads complete the caller's
//! [`Completion`] when the response frame arrives (or a timeout or
//! connection failure gets there first).
//!
//! ```no_run
//! use basalt_driver::{ClusterConfig, Session};
//!
//! let session = Session::connect(
//!     ClusterConfig::new().with_contact_point("127.0.0.1"),
//! )?;
//! let result = session.execute("SELECT now()");
//! let response = result.wait()?;
//! # Ok::<(), basalt_driver::DriverError>(())
//! ```
//!
//! Diagnostics go through `tracing`; the library never installs a
//! subscriber, so output is discarded unless the embedding application
//! installs one.

pub mod auth;
pub mod completion;
pub mod config;
mod connection;
pub mod error;
pub mod host;
pub mod policy;
mod pool;
pub mod session;

pub use auth::{AuthProvider, PlainTextAuthProvider};
pub use completion::{AlreadyCompleted, Completion};
pub use config::ClusterConfig;
pub use error::{DriverError, DriverResult};
pub use host::{Host, HostEvent};
pub use policy::{
    ExponentialBackoffPolicy, FixedDelayPolicy, LoadBalancingPolicy, ReconnectionPolicy,
    RoundRobinPolicy, WhitelistPolicy,
};
pub use session::{RequestCompletion, Session};

pub use basalt_protocol::{Request, Response};
