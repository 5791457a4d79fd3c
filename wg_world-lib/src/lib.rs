pub mod address_set;
pub mod confset;
pub mod config;
pub mod exec;
pub mod host;
pub mod key;
pub mod logging;
pub mod netns;
pub mod network;
pub mod primitive;
pub mod supervisor;
