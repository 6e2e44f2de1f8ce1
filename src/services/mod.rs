pub mod archive;
pub mod bandwidth;
pub mod directory;
pub mod metadata_store;
pub mod object_store;
pub mod password;
