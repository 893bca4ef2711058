// Recorded TV catalog backend (Rust native implementation)
pub mod pvr;

pub use pvr::callbacks::{AddonCallbacks, FileProperties, LocalAddon, PvrCallbacks};
pub use pvr::models::{PvrProperties, Recording, Settings};
pub use pvr::{init_logging, PvrService};
