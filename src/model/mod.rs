pub mod agent;
pub mod credential;
pub mod execution;
pub mod metadata;
pub mod target;
pub mod trust;

pub use agent::{AgentRequest, AgentResponse, ResponseState};
pub use credential::{Credential, EntryIdentity};
pub use execution::{ExecutionOutcome, ExecutionUnit, OutcomeClass};
pub use metadata::{KeyBlob, MetadataEntry, MetadataItem, MetadataResource, MetadataScope};
pub use target::Target;
pub use trust::TrustRecord;
