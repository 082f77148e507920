//! `kmvd` is a small networked service storing one KMV (K-Minimum-Values)
//! cardinality sketch per key, with set-algebra queries (union, Jaccard,
//! cardinality of unions/intersections) composed over those sketches.

pub mod config;
pub mod error;
pub mod hash;
pub mod http;
pub mod query;
pub mod sketch;
pub mod store;

pub use error::Error;
pub use sketch::Sketch;
pub use store::{Command, StoreHandle, StorePool};
