pub mod connection;

pub use connection::{SenderPhase, WriterState};
