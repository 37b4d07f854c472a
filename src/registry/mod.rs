pub mod used_file;

pub use used_file::{RegistryError, UsedFile, UsedFileRepository};
