//! Top-level facade crate for portlink.
//!
//! Re-exports the protocol core and the engine so users can depend on a single crate.

pub mod core {
    pub use portlink_core::*;
}

pub mod engine {
    pub use portlink_engine::*;
}
