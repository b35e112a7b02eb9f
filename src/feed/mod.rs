//! Transaction feed: canonical records, normalization and the bounded store

pub mod normalize;
pub mod record;
pub mod store;

pub use normalize::normalize;
pub use record::{format_ether, TransactionRecord, TransactionView, TxStatus, SENTINEL_HASH};
pub use store::{FeedSnapshot, FeedStore, DEFAULT_CAPACITY};
