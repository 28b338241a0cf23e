pub mod connector;
pub mod descriptor;
pub mod pool;
pub mod prober;

pub use descriptor::{ProxyDescriptor, SocksProtocol};
pub use pool::ProxyPool;
