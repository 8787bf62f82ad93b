pub mod classifier;
pub mod config;
pub mod crm;
pub mod db;
pub mod error;
pub mod mailbox;
pub mod model;
pub mod pipeline;
