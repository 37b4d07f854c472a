pub mod db;
pub mod dropbox;
pub mod files;
pub mod ls;
pub mod sync;
