//! Connection plumbing: the reader task and the facade that ties it to a
//! writer over one socket.

mod connection;
mod reader;

pub use connection::Connection;
