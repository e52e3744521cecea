pub mod config;
pub mod dag;
pub mod decomposition;
pub mod dispatch;
pub mod errors;
pub mod gate;
pub mod init;
pub mod mode;
pub mod retry;
pub mod store;
