pub mod object_store;
pub mod schema;
pub mod store;

pub use object_store::{HttpObjectStore, LocalObjectStore, ObjectMeta, ObjectStore};
pub use store::{AttemptStats, RecordOutcome, Store, StoredSubmission, SubmissionStore};
