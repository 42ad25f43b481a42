pub mod connection;
pub mod dimension;
pub mod frame;

pub use connection::MuxConnection;
pub use dimension::DimensionAuthority;
pub use frame::MuxFrame;
