//! Core types for the broker operator

mod client;
mod node;
mod status;
mod tls;

pub use client::*;
pub use node::*;
pub use status::*;
pub use tls::*;
