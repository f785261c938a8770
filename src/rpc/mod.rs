pub mod protocol;
mod tcp;

pub use tcp::{BrokerClient, serve};
