//! Resilient Fetch Pattern and the network seam it runs over.

pub mod cache;
pub mod fetcher;
pub mod state_machine;
pub mod transport;

pub use cache::{CacheRegistry, PurgeableCache, ResponseCache};
pub use fetcher::{FetchOptions, FetchStatus, LoadOutcome, PayloadSource, ResilientFetcher, Validator};
pub use state_machine::{LoadEvent, LoadMachine, LoadPhase};
pub use transport::{FetchRequest, FetchResponse, HttpMethod, ReqwestTransport, Transport};
