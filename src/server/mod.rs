mod handlers;
mod server;
#[cfg(test)]
mod tests;

pub use server::{PresenceServer, PresenceServerBuilder, ServerState};
