pub mod device;
pub mod frames;
pub mod gateway;
pub mod lorawan;
