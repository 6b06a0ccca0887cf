pub mod lru;

pub use lru::Lru;
