//! Test doubles for the transport and the clock

use std::cell::Cell;
use std::collections::VecDeque;
use std::time::Duration;

use crate::{Clock, Error, Transport};

/// A clock that moves by a fixed step on every reading.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Duration>,
    step: Duration,
}

impl ManualClock {
    /// A clock that advances by `step` every time it is read
    pub fn stepping(step: Duration) -> ManualClock {
        ManualClock {
            now: Cell::new(Duration::from_secs(0)),
            step,
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        let now = self.now.get();
        self.now.set(now + self.step);
        now
    }
}

/// Scripted transport: queued chunks are handed out one per `read_available` call and replies
/// can be armed to arrive right after a given write.
#[derive(Debug, Default)]
pub struct MockTransport {
    incoming: VecDeque<Vec<u8>>,
    replies: VecDeque<(Vec<u8>, Vec<Vec<u8>>)>,
    pub written: Vec<Vec<u8>>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport::default()
    }

    /// Queues `chunk` to be returned by a future `read_available`
    pub fn push_incoming(&mut self, chunk: &[u8]) {
        self.incoming.push_back(chunk.to_vec());
    }

    /// Arms `chunks` to be queued once exactly `trigger` has been written
    pub fn reply_to(&mut self, trigger: &[u8], chunks: &[&[u8]]) {
        self.replies.push_back((
            trigger.to_vec(),
            chunks.iter().map(|chunk| chunk.to_vec()).collect(),
        ));
    }
}

impl Transport for MockTransport {
    fn read_available(&mut self) -> Result<Vec<u8>, Error> {
        Ok(self.incoming.pop_front().unwrap_or_default())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.written.push(bytes.to_vec());

        if let Some((trigger, _)) = self.replies.front() {
            if trigger.as_slice() == bytes {
                if let Some((_, chunks)) = self.replies.pop_front() {
                    self.incoming.extend(chunks);
                }
            }
        }

        Ok(())
    }
}
