//! Domain models: machines, firmware classes, boot specs, events.

pub mod events;
pub mod machine;
pub mod spec;

pub use events::{Event, EventLog, MachineState};
pub use machine::{mac_string, Architecture, Firmware, Machine};
pub use spec::{BootFile, FileId, Spec};
