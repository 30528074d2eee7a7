pub mod journal;
pub mod mem;
pub mod persistent;
pub mod snapshot;
pub mod traits;


pub use mem::InMemoryStore;
pub use persistent::PersistentStore;
pub use traits::*;
