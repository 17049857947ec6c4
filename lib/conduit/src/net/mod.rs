pub mod address;
pub mod buffer;
pub mod endpoint;
pub mod queue;
pub mod session;
pub mod upstream;
pub mod wire;
