#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod checksum;
pub mod clock;
pub mod config;
pub mod element;
pub mod error;
pub mod handlespace;
pub mod management;
pub mod peer_list;
pub mod policy;
pub mod pool;
pub mod pool_handle;
pub mod registrar;
pub mod service;
pub mod takeover;
pub mod transport;

pub use config::RegistrarConfig;
pub use element::{
    Connection, ElementKey, ElementRegistration, PoolElementIdentifier, PoolElementNode,
    RegistrarIdentifier,
};
pub use error::{RegistrarError, ServiceError};
pub use handlespace::{HandlespaceChange, HandlespaceObserver, PoolHandlespace, UpdateAction};
pub use management::PoolHandlespaceManagement;
pub use peer_list::PeerListManagement;
pub use policy::{PoolPolicy, PoolPolicySettings};
pub use pool_handle::PoolHandle;
pub use registrar::{OutboundMessage, Registrar, RegistrarNotifier};
pub use service::{spawn, RegistrarRef};
pub use takeover::TakeoverProcess;
pub use transport::{TransportAddressBlock, TransportProtocol};
