pub mod dispatcher;
pub mod http;
pub mod store;

pub use dispatcher::{RequestDispatcher, OutboundRequest, Payload};
pub use http::HttpBackend;
pub use store::{FileStore, MemoryStore};
