pub mod analyzer;
pub mod image_fetcher;
pub mod key_store;
pub mod metrics;
pub mod providers;
pub mod sessions;

pub use analyzer::{AnalysisInput, AnalysisOutcome, ChartAnalyzer};
pub use image_fetcher::{FetchedImage, ImageFetchError, ImageFetcher};
pub use key_store::{KeyStore, MemoryKeyStore, PgKeyStore};
pub use sessions::SessionStore;
