//! Pooled buffers and buffer-sequence I/O
//!
//! Every byte moving through the relay rides in a [`Buffer`] drawn from a
//! shared pool and returned on drop. A [`MultiBuffer`] is an ordered run of
//! buffers that can be filled, drained, and sliced without copying payload
//! bytes. The [`Reader`]/[`Writer`] traits plus [`pipe`] are the common
//! forwarding loop used by every proxy handler.

mod buffer;
mod multi;
mod pipe;

pub use buffer::{
    medium_pool, small_pool, Buffer, BufferPool, PoolStats, PoolStatsSnapshot, BUFFER_SIZE,
    POOL_SIZE_ENV, POOL_SIZE_ENV_LEGACY, SMALL_BUFFER_SIZE,
};
pub use multi::MultiBuffer;
pub use pipe::{copy_from_reader, pipe, MergingReader, Reader, TimeoutReader, Writer};
