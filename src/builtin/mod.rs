//! Modules shipped with the host.

use plexus_bus::ModuleCatalog;

pub mod clock;
pub mod heartbeat;
pub mod stats;

/// Broadcast by the frame loop before the update callbacks of each frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Frame {
    pub index: u64,
    /// Whether physics callbacks run this frame
    pub physics: bool,
}

/// Builtin modules, followed by every module other linked crates submitted.
pub fn builtin_catalog() -> ModuleCatalog {
    let mut catalog = ModuleCatalog::new()
        .with::<clock::SystemClock>()
        .with::<stats::FrameStats>()
        .with::<heartbeat::Heartbeat>();
    catalog.extend_discovered();
    catalog
}
