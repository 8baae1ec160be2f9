//! Transport module - TCP socket handling.
//!
//! Wraps tokio's TCP types so every socket the crate touches gets the same
//! options (Nagle disabled: frames are already batched by the writer).

mod tcp;

pub use tcp::{dial, Listener};
