pub mod cache;
pub mod client;
mod common;
pub mod compile;
pub mod discovery;
mod error;
pub mod machine;
pub mod monitor;
pub mod net;
pub mod protocol;
pub mod scheduler;
pub mod server;
mod util;
pub mod worker;

pub use error::CbdError;
pub use util::setup_interrupt;

pub type Error = error::CbdError;
pub type Result<T> = std::result::Result<T, Error>;

/// Default port of the coordinator service.
pub const DEFAULT_SERVER_PORT: u16 = 15796;
/// Default port workers accept compile jobs on.
pub const DEFAULT_WORKER_PORT: u16 = 15797;
/// Beginning of the worker auto-listen port range.
pub const START_PORT: u16 = DEFAULT_WORKER_PORT;
/// End of the worker auto-listen port range (inclusive).
pub const END_PORT: u16 = 15900;
/// UDP port used for coordinator auto-discovery.
pub const DISCOVERY_PORT: u16 = 15932;
