//! Read-only chain RPC surface consumed by the listener.

mod traits;

pub use traits::*;
