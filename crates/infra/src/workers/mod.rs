//! Background workers.

pub mod consumer;

pub use consumer::{
    AckPolicy, ConsumerHandle, ConsumerOptions, ConsumerRuntime, ConsumerState, ConsumerStats,
    dead_letter_queue,
};
