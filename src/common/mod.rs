pub type Map<K, V> = hashbrown::HashMap<K, V>;

pub use transport::make_protocol_builder;
pub use wrapped::WrappedRcRefCell;

mod transport;
mod wrapped;
