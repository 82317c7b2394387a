//! Backend clients: catalog, credentials, concurrency gate and HTTP clients.

mod catalog;
mod credentials;
mod gate;
mod judge;
mod provider;
pub mod stream;

pub use catalog::*;
pub use credentials::*;
pub use gate::*;
pub use judge::*;
pub use provider::*;
