pub mod elasticsearch;
pub mod etcd_store;
pub mod http_client;
pub mod http_handler;
pub mod memory_store;

/// Re-export commonly used types from adapters
pub use elasticsearch::ElasticsearchWriter;
pub use etcd_store::EtcdStore;
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use memory_store::MemoryStore;
