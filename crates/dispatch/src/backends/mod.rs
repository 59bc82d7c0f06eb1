//! Accelerated LinUCB backends.
//!
//! Each module implements [`amas_core::accel::AcceleratedBandit`]. The
//! dispatcher picks one at construction and treats every error it returns as
//! a reason to fall back to the reference model.

pub mod batched;
