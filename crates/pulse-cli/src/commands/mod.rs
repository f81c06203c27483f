//! CLI subcommand implementations.

pub mod buckets;
pub mod flush;
pub mod query;
pub mod queue;
pub mod record;
mod util;
