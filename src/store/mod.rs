pub mod connection_cache;
pub mod feed;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use connection_cache::*;
pub use feed::*;
pub use memory::*;
pub use postgres::*;
pub use traits::*;
