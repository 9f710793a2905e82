//! Start routines of the built-in controllers.
//!
//! Each routine subscribes to the informers it needs, spawns its loops and
//! returns the sync barrier over the caches it requires. None of them waits
//! for anything itself.

pub mod autoscalers;
pub mod cluster_checks;
pub mod metadata;
