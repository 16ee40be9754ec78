//! Braid - the execution core of an Orc runtime
//!
//! A compiled program arrives as an immutable [`Graph`]. The [`Engine`]
//! drives lightweight tokens through it on a single thread: forks admit new
//! tokens, pruning and otherwise combinators open regions that track and
//! cancel the tokens inside them, and calls to external [`Site`]s park a
//! token until the site answers through its [`ReturnHandle`].

pub mod arena;
pub mod blocking_pool;
pub mod cell;
pub mod config;
pub mod control;
pub mod env;
pub mod errors;
pub mod eval;
pub mod graph;
pub mod prelude;
pub mod region;
pub mod runtime;
pub mod site;
pub mod sink;
pub mod test_support;
pub mod timer;
pub mod token;
pub mod value;

pub use config::EngineConfig;
pub use control::EngineHandle;
pub use errors::{ConfigError, EngineError, GraphError, SiteError};
pub use eval::{Engine, EngineStats, RunOutcome, StepOutcome};
pub use graph::{Arg, Def, Graph, GraphBuilder, Literal, Node, NodeId};
pub use region::{RegionId, RegionState};
pub use site::{BlockingSite, Capability, FnSite, ReturnHandle, Site, SiteOutcome, SiteTable};
pub use sink::{BufferSink, FnSink, PublicationSink};
pub use value::Value;
