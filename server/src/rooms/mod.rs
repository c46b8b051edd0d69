pub mod listing;
pub mod registry;

pub use registry::{JoinResult, Member, Registry, RelayOutcome, RoomSnapshot};
