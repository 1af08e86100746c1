//! Traits at the executor and device-collaborator seams

mod backend;
mod executor;

pub use backend::{DeviceBackend, DeviceResult};
pub use executor::{BoundOperand, BoundStep, Executor};
