pub mod store;

pub use store::{PersistedPosition, PositionStore};
