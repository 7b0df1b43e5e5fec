//! Replicator plugins shipped with the operator

pub mod simple;
