//! Per-account change log for incremental client sync

mod repository;

pub use repository::ChangeLogRepository;
