pub mod change;
pub mod common;
pub mod realtime;
pub mod schema;
pub mod tenant;
pub mod user_context;

pub use change::*;
pub use common::*;
pub use realtime::*;
pub use schema::*;
pub use tenant::*;
pub use user_context::*;
