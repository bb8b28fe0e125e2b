pub mod deploy;
pub mod error;
pub mod linkedit;
pub mod pe_patch;
pub mod qml;
pub mod stage;
pub mod translations;

pub use error::DeployError;
