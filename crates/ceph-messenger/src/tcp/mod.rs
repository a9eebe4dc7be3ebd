mod stream;

pub use stream::{ConnState, RawFrame, TcpStream};
