pub mod embed;
pub mod local;
pub mod remote;
