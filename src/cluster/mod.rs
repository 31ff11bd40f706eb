// Cluster mesh: backend nodes discover each other through the coordination
// store, dial their declared dependencies, and authenticate registrations
// with a signed token.

pub mod backend;
pub mod discovery;
pub mod info;
pub mod node;
pub mod token;

pub use backend::Backend;
pub use discovery::{EtcdDiscovery, ServiceSink};
pub use info::NodeInfoMap;
pub use node::NodeCore;
pub use token::sign_access_token;
