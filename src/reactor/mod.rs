//! The reactor: one poll thread fanning readiness out to a fixed set of
//! shards, each shard reading its connections and feeding the worker pool.

pub use main_reactor::{MainReactor, ReactorBuilder};
pub use sub_reactor::SubReactor;

mod main_reactor;
mod sub_reactor;
