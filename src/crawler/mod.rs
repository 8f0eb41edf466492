pub mod hasher;
pub mod options;
pub mod request;
pub mod requested_queue;
pub mod response;
pub mod spider;
pub mod throttle;

// Re-export common types
pub use hasher::{RequestHasher, Sha256RequestHasher};
pub use options::{RuntimeOptions, SpiderOptions};
pub use request::{Request, RequestContent, RequestPolicy};
pub use requested_queue::RequestedQueue;
pub use response::{RedirectResponse, Response, TransportFailure};
pub use spider::{Spider, SpiderBuilder, SpiderHooks, SpiderId};
