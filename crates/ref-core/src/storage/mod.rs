pub mod rows;
pub mod schema;
pub mod store;

pub use rows::{ExecutionResultRow, ExecutionRow, NewExecution, ProviderRow};
pub use store::{Store, StoreError};
