//! Domain layer - Core types and port definitions
//!
//! This module defines the QoS limit model and the traits (ports) that
//! backend and platform adapters implement, following hexagonal
//! architecture principles.

pub mod ports;
pub mod qos;

pub use ports::*;
pub use qos::*;
