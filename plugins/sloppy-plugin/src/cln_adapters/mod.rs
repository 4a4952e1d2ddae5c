pub mod hooks;
pub mod model;
pub mod rpc;
