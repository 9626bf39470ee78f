pub mod codec;
pub mod config;
pub mod error;
pub mod input;
pub mod message;
pub mod session;
pub mod transport;
pub mod util;

#[cfg(test)] pub mod test_util;
