//! Core primitives for the geotrace proximity tracing engine.

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod constants;
pub mod crypto;
pub mod errors;
pub mod geohash;
pub mod traits;
pub mod types;

pub use constants::*;
pub use errors::{ErrorSet, ErrorState};
pub use types::*;

pub use crypto::{derive_ephid, hash_with_domain, token_digest, DOMAIN_EPHID};
pub use geohash::GeohashNeighborhood;
pub use traits::RetentionBound;
