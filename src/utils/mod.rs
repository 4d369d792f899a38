pub use ring_buffer::RingBuffer;
pub use worker_pool::WorkerPool;

mod ring_buffer;
mod worker_pool;
