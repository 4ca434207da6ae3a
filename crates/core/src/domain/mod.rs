pub mod attachment;
pub mod phase;
pub mod service_name;
pub mod unit;
