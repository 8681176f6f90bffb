pub mod error;
pub mod fetcher;
pub mod result;

pub use error::ScanError;
pub use fetcher::Fetcher;
pub use result::{FetchOutcome, FetchedPage};
