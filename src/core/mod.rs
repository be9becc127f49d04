pub mod audit;
pub mod bus;
pub mod events;
pub mod ids;

pub use audit::{AuditEntry, AuditJournal};
pub use bus::EventBus;
pub use events::{Event, EventKind};
pub use ids::IdGen;
