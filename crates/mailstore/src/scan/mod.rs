//! Lazy, paginated reads over ordered rows
//!
//! Pages are read-committed: rows changed between two page fetches show up
//! as they are when their page is fetched, not as they were when the scan
//! started.

mod messages;
mod paginator;

pub use messages::MessageScanner;
pub use paginator::Paginated;
