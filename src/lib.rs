pub mod budget;
pub mod config;
pub mod control;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod logging;
pub mod memory;
pub mod notify;
pub mod phases;
pub mod sandbox;
pub mod scm;
pub mod skip;
pub mod util;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;
