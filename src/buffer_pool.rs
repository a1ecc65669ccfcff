use bytes::BytesMut;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Pool of reusable send buffers, sized for one full outgoing datagram each. Buffers in
///  excess of the pool size are discarded when they are returned.
pub struct SendBufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl SendBufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> SendBufferPool {
        SendBufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        if buffer.capacity() < self.buf_size {
            // the buffer was split off or shrunk by the caller, re-pooling it would shrink
            //  the pool's buffers over time
            debug!("returned buffer lost capacity: discarding");
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}
