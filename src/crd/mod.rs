//! Custom Resource Definitions for the stack controller
//!
//! `v1alpha3` is the stored, canonical schema the controller reconciles.
//! `v1beta2` is still served and converted through [`conversion`].

pub mod conversion;
mod stack;
pub mod types;
pub mod v1beta2;

#[cfg(test)]
mod tests;

pub use conversion::StackConversion;
pub use stack::{
    SpecValidationError, Stack, StackPhase, StackSpec, StackStatus, API_GROUP, STORAGE_VERSION,
};
pub use types::*;
