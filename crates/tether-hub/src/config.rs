use serde::{Deserialize, Serialize};

use crate::{
    chunk::{CHUNK_HEADER_LEN, MAX_CHUNK_LEN},
    error::HubError,
};

pub const DEFAULT_FRAME_SIZE: u16 = 8192;

/// Tuning knobs for a [`crate::Hub`] and the transports it creates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HubConfig {
    /// Largest payload carried by a single outgoing chunk, at most 32767.
    pub frame_size: u16,
    /// Initial capacity of a transport's read buffer.
    pub read_buf_initial: usize,
    /// Hard cap of a transport's read buffer. Saturating it without a
    /// complete packet in view aborts the transport.
    pub read_buf_limit: usize,
    /// Initial capacity of a transport's write buffer.
    pub write_buf_initial: usize,
    /// Hard cap of a transport's write buffer. Writers block once resident
    /// bytes reach it.
    pub write_buf_limit: usize,
    /// Capacity of the selector's event batch.
    pub events_capacity: usize,
    /// Kernel SO_SNDBUF / SO_RCVBUF applied to duplex sockets.
    pub socket_buf_size: Option<usize>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            read_buf_initial: 16 * 1024,
            read_buf_limit: i32::MAX as usize,
            write_buf_initial: 16 * 1024,
            write_buf_limit: 256 * 1024,
            events_capacity: 128,
            socket_buf_size: None,
        }
    }
}

impl HubConfig {
    pub fn with_frame_size(mut self, frame_size: u16) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn with_read_buf(mut self, initial: usize, limit: usize) -> Self {
        self.read_buf_initial = initial;
        self.read_buf_limit = limit;
        self
    }

    pub fn with_write_buf(mut self, initial: usize, limit: usize) -> Self {
        self.write_buf_initial = initial;
        self.write_buf_limit = limit;
        self
    }

    pub fn with_socket_buf_size(mut self, size: usize) -> Self {
        self.socket_buf_size = Some(size);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), HubError> {
        if self.frame_size == 0 || usize::from(self.frame_size) > MAX_CHUNK_LEN {
            return Err(HubError::Config("frame_size must be in 1..=32767"));
        }
        if self.read_buf_initial == 0 || self.read_buf_initial > self.read_buf_limit {
            return Err(HubError::Config("read buffer initial size exceeds its limit"));
        }
        if self.write_buf_initial == 0 || self.write_buf_initial > self.write_buf_limit {
            return Err(HubError::Config("write buffer initial size exceeds its limit"));
        }
        // One framed chunk must fit the cap, so a producer blocked on
        // backpressure always has write interest armed behind it.
        if self.write_buf_limit < usize::from(self.frame_size) + CHUNK_HEADER_LEN {
            return Err(HubError::Config("write buffer limit cannot hold a full frame"));
        }
        if self.events_capacity == 0 {
            return Err(HubError::Config("events_capacity must be positive"));
        }
        Ok(())
    }
}
