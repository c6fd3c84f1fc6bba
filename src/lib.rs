#![forbid(unsafe_code)]

//! # Magpie
//!
//! Request-routing and replication-coordination core for a multi-replica,
//! eventually-consistent object store. The proxy is a stateless frontend:
//! it maps `/v1/<account>[/<container>[/<object>]]` requests onto quorum
//! fan-outs against backend storage nodes chosen by a consistent-hash ring,
//! streaming bodies through without buffering.
//!
//! ## Pieces
//!
//! - **Ring**: immutable consistent-hash placement, loaded once.
//! - **ErrorLimiter / NodeIterator**: per-node failure windows and the
//!   primaries-then-handoffs selection walk.
//! - **LookupCache**: account/container existence, ACLs, advisory locks.
//! - **Replicator**: the fan-out engine: concurrent dispatch, the
//!   100-continue write gate, chunked body pumping, best-response selection.
//! - **Controllers**: account/container/object verb handlers, including
//!   server-side copy, delayed deletion, versioning and manifest-assembled
//!   large objects.
//! - **Application**: path parsing, method dispatch, the hyper service.
//!
//! Every time- or network-touching component takes its collaborators at
//! construction (`Clock`, `Sleeper`, `Transport`, cache backend), so tests
//! run deterministically against scripted fakes.

pub mod acl;
pub mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod constraints;
pub mod controllers;
pub mod error;
pub mod error_limit;
pub mod headers;
pub mod large_object;
pub mod node_iter;
pub mod replicate;
pub mod ring;
pub mod sleeper;
pub mod timestamp;
pub mod transport;
pub mod transport_http;
pub mod versioned;

// Re-exports: the surface a deployment touches.
pub use app::{serve, Application, ApplicationBuilder, Rings};
pub use cache::{AccountInfo, CacheBackend, ContainerInfo, LookupCache, MemoryCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ProxyConfig};
pub use controllers::{AuthContext, AuthDenial, Authorizer};
pub use error::{CacheError, ProxyError, TransportError};
pub use error_limit::ErrorLimiter;
pub use replicate::{BestResponse, BodySource, Replicator, ReplicatorConfig};
pub use ring::{Node, Ring, RingData, RingError};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timestamp::{Timestamp, TimestampIssuer};
pub use transport::{BodyKind, Exchange, RequestHead, ResponseHead, Transport};
pub use transport_http::HttpTransport;
