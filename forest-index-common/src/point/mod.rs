pub mod file;
pub mod format;
pub mod record;
pub mod upgrade;

pub use file::{PointFile, SideStream};
pub use format::PointFormat;
pub use record::{PointRecord, SideAttributes};
