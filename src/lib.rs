//! Client-side query cache and synchronization layer for a pipeline
//! monitoring dashboard.
//!
//! Views subscribe to [`QueryKey`]s through a [`Dashboard`]; the
//! [`QueryCache`] deduplicates fetches, keeps entries fresh by polling and
//! serves stale data while refreshes fail. Edits go through the
//! [`MutationCoordinator`], which shows them optimistically and rolls them
//! back when the remote store rejects them.

pub mod aggregate;
pub mod cache;
pub mod dashboard;
pub mod error;
pub mod model;
pub mod mutation;
pub mod remote;
pub mod scheduler;

pub use aggregate::HealthPolicy;
pub use cache::{PolicyClass, QueryCache, QueryKey, QueryOptions, QueryStatus, Subscription};
pub use dashboard::Dashboard;
pub use error::{MutationError, RemoteError, StaleDataWarning, ValidationError};
pub use mutation::{MutationCoordinator, MutationState, ProfilePatch};
pub use remote::{MemorySource, PostgrestSource, RemoteDataSource, WithTimeout};
