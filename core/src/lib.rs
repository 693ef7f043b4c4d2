//! Assign stable, content-addressed accessions to domain objects.
//!
//! An accession is a unique identifier assigned once per distinct content
//! hash and never reassigned while active. This crate provides the
//! resolution layer that decides, for a batch of objects, which ones receive
//! fresh accessions and which ones already have them:
//!
//! - [`service::AccessioningService`] drives the idempotent get-or-create
//!   protocol against an [`store::ObjectStore`] and an
//!   [`generator::AccessionGenerator`].
//! - [`retry`] provides the bounded exponential-backoff combinator used to
//!   absorb transient races against shared state.
//! - [`hashing`] bundles a deterministic content-hash function; any other
//!   deterministic hash works as well.
//!
//! Identifier generation itself lives in a companion crate; this crate only
//! defines the seam ([`generator::AccessionGenerator`]) it is driven
//! through.

pub mod generator;
pub mod hashing;
pub mod models;
pub mod retry;
pub mod service;
pub mod store;
