// Backend plumbing for the chat core: REST client, real-time document store
// and the message transport adapter built on both.

pub mod adapter;
pub mod api;
pub mod docstore;
pub mod feed;
pub mod rest;
pub mod subscription;

pub use adapter::MessageTransport;
pub use api::MessageApi;
pub use docstore::{DocumentStore, MemoryStore};
pub use rest::RestClient;
pub use subscription::Subscription;
