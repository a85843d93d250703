pub mod append;
pub mod block;
pub mod codec;
pub mod factory;
pub mod fs;
pub mod header;
pub mod index;
pub mod partition;
pub mod partition_file;
pub mod relational;

pub use append::AppendOnlyStore;
pub use block::BlockStore;
pub use factory::{open_reader, open_store};
pub use relational::{ReadOnlyRelationalStore, RelationalStore};
