pub mod buffer;
pub mod codec;
pub mod proto;

pub use self::buffer::ReadBuffer;
pub use self::buffer::WriteBuffer;
