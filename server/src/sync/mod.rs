//! Reconciliation: bring the content store in line with the authority's
//! manifest.
//!
//! One pass is `manifest::fetch` -> `ContentStore::compute_missing` ->
//! `fetch::fetch_missing`, driven by [`engine::Reconciler`] and optionally
//! repeated by [`schedule::spawn_periodic`].

pub mod authority;
pub mod engine;
pub mod fetch;
pub mod manifest;
pub mod schedule;
