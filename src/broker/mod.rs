pub mod dispatcher;
pub mod server;

pub use dispatcher::{Dispatcher, Outbound, Route};
pub use server::Broker;
