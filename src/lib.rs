//! restfuzz core library: OpenAPI model, fuzzing engine and workspace plumbing.

#[path = "runtime/auth.rs"]
mod auth;
#[path = "runtime/clock.rs"]
mod clock;
#[path = "platform/config.rs"]
mod config;
#[path = "cmd/corpus.rs"]
mod corpus;
#[path = "runtime/coverage.rs"]
mod coverage;
#[path = "model/dependency.rs"]
mod dependency;
#[path = "platform/time_budget.rs"]
mod time_budget;
#[path = "platform/envinfo.rs"]
mod envinfo;
#[path = "platform/error.rs"]
mod error;
#[path = "platform/fsutil.rs"]
mod fsutil;
#[path = "modes/fuzz.rs"]
mod fuzz;
#[path = "runtime/grammar.rs"]
mod grammar;
#[path = "cmd/init.rs"]
mod init;
#[path = "runtime/mutator.rs"]
mod mutator;
#[path = "model/openapi.rs"]
mod openapi;
#[path = "model/plan.rs"]
mod plan;
#[path = "model/reporting.rs"]
mod reporting;
#[path = "runtime/resolver.rs"]
mod resolver;
#[path = "runtime/store.rs"]
mod store;
#[path = "runtime/transport.rs"]
mod transport;
#[path = "model/value.rs"]
mod value;

pub use auth::*;
pub use clock::*;
pub use config::*;
pub use corpus::*;
pub use coverage::*;
pub use dependency::*;
pub use time_budget::*;
pub use envinfo::*;
pub use error::*;
pub use fsutil::*;
pub use fuzz::*;
pub use grammar::*;
pub use init::*;
pub use mutator::*;
pub use openapi::*;
pub use plan::*;
pub use reporting::*;
pub use resolver::*;
pub use store::*;
pub use transport::*;
pub use value::*;
