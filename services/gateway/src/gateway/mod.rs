pub mod actions;
pub mod compliance;
pub mod credentials;
pub mod document;
pub mod guest;
pub mod quota;
pub mod session;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the context so the binary can build everything from one place.
pub use state::{Backends, GatewayContext, Stores};
