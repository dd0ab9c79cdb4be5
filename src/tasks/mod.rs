//! Background Tasks Module
//!
//! Contains the background work a store runs on its own.
//!
//! # Tasks
//! - Expiration timer: sweeps expired entries at the earliest pending deadline

mod expiry;

pub(crate) use expiry::{ExpirationTimer, ExpirySweeper};
