pub mod cardinality;
pub mod context;
pub mod coordinator;
pub mod ddl;
pub mod diff;
pub mod endpoint;
pub mod identity;
pub mod rebase;
pub mod reconciler;
pub mod router;

pub use cardinality::*;
pub use context::*;
pub use coordinator::*;
pub use ddl::*;
pub use diff::*;
pub use endpoint::*;
pub use identity::*;
pub use rebase::*;
pub use reconciler::*;
pub use router::*;
