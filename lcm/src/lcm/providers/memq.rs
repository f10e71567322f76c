//! The in-memory queue provider.
//!
//! Loops published messages straight back to the local subscribers with no
//! network involved. Handy for tests and for single-process pipelines that
//! want the LCM API without the multicast setup requirements.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use error::*;
use lcm::registry::Registry;
use utils::{self, Pipe};

struct MemqMsg {
    channel: String,
    data: Vec<u8>,
    recv_utime: i64,
}

/// The in-memory queue provider.
pub struct MemqProvider {
    registry: Arc<Registry>,
    queue: Mutex<VecDeque<MemqMsg>>,
    notify_pipe: Pipe,
}

impl MemqProvider {
    pub fn new(registry: Arc<Registry>) -> Result<MemqProvider, InitError> {
        debug!("Starting memq provider");
        Ok(MemqProvider {
            registry,
            queue: Mutex::new(VecDeque::new()),
            notify_pipe: Pipe::notify()?,
        })
    }

    /// Queues a message for local delivery.
    pub fn publish(&self, channel: &str, data: &[u8]) -> Result<(), PublishError> {
        if !self.registry.has_handlers(channel) {
            debug!(
                "Dropping message on [{}] ({} bytes): no subscribers",
                channel,
                data.len()
            );
            return Ok(());
        }

        let msg = MemqMsg {
            channel: channel.to_string(),
            data: data.to_vec(),
            recv_utime: utils::timestamp_now(),
        };

        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            self.notify_pipe.poke()?;
        }
        queue.push_back(msg);
        Ok(())
    }

    /// Delivers the oldest queued message.
    pub fn handle(&self) -> Result<(), HandleError> {
        self.notify_pipe.drain_one()?;

        let msg = {
            let mut queue = self.queue.lock().unwrap();
            let msg = match queue.pop_front() {
                Some(msg) => msg,
                None => return Err(HandleError::SpuriousWakeup),
            };
            if !queue.is_empty() {
                self.notify_pipe.poke()?;
            }
            msg
        };

        debug!(
            "Dispatching message on channel [{}], size [{}]",
            msg.channel,
            msg.data.len()
        );
        if self.registry.try_enqueue_message(&msg.channel) {
            self.registry
                .dispatch(&msg.channel, &msg.data, msg.recv_utime);
        }
        Ok(())
    }

    pub fn fileno(&self) -> Result<RawFd, HandleError> {
        Ok(self.notify_pipe.raw_read_fd())
    }
}
