pub mod config;
pub mod error;
pub mod events;
pub mod processing;
pub mod remote;
pub mod tasks {
    pub mod console;
    pub mod coordinator;
    pub mod export;
}
