pub mod collection;
pub mod config;
pub mod error;
pub mod object;
pub mod reactor;
pub mod runtime;
pub mod secure;
pub mod server;
pub mod signal;

pub use config::RuntimeConfig;
pub use runtime::Runtime;
pub use server::Server;
