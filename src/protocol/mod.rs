pub mod connection;
pub mod messages;

pub use connection::{add_port_if_needed, connect, MessageConnection, DEFAULT_TIMEOUT};
pub use messages::Message;
