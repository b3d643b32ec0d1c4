//! The opaque byte-stream seam used for load/save over the session layer.
//!
//! The bulk-transfer substrate itself is an external collaborator; the core
//! only needs to open an out-stream (getting back an id it can put on the
//! wire) and accept an in-stream for an id a peer announced. The channel
//! hub below is the in-process realization used by tests and single-process
//! deployments.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Identifies a byte stream within the transfer substrate.
pub type StreamId = u32;

/// The substrate interface the session layer programs against.
pub trait StreamHub: Send + Sync {
    /// Opens a new out-stream. The returned id can be announced to a peer;
    /// dropping the writer ends the stream.
    fn open_out_stream(&self) -> (StreamId, Box<dyn Write + Send>);

    /// Accepts the in-stream a peer announced under `stream_id`. Each
    /// stream can be accepted once.
    fn accept_in_stream(&self, stream_id: StreamId) -> io::Result<Box<dyn Read + Send>>;
}

/// In-process hub: streams are chunk channels between threads.
#[derive(Default)]
pub struct ChannelStreamHub {
    next_id: AtomicU32,
    pending: Mutex<HashMap<StreamId, Receiver<Vec<u8>>>>,
}

impl ChannelStreamHub {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamHub for ChannelStreamHub {
    fn open_out_stream(&self) -> (StreamId, Box<dyn Write + Send>) {
        let stream_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = unbounded();
        self.pending.lock().unwrap().insert(stream_id, receiver);
        (stream_id, Box::new(ChunkWriter { sender }))
    }

    fn accept_in_stream(&self, stream_id: StreamId) -> io::Result<Box<dyn Read + Send>> {
        let receiver = self
            .pending
            .lock()
            .unwrap()
            .remove(&stream_id)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no stream {stream_id}"))
            })?;
        Ok(Box::new(ChunkReader {
            receiver,
            current: Vec::new(),
            offset: 0,
        }))
    }
}

struct ChunkWriter {
    sender: Sender<Vec<u8>>,
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.sender
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream reader is gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ChunkReader {
    receiver: Receiver<Vec<u8>>,
    current: Vec<u8>,
    offset: usize,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset == self.current.len() {
            match self.receiver.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.offset = 0;
                }
                // Writer dropped: end of stream.
                Err(_) => return Ok(0),
            }
        }
        let available = self.current.len() - self.offset;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn bytes_flow_writer_to_reader() {
        let hub = ChannelStreamHub::new();
        let (stream_id, mut writer) = hub.open_out_stream();
        let mut reader = hub.accept_in_stream(stream_id).unwrap();

        let producer = thread::spawn(move || {
            writer.write_all(b"hello ").unwrap();
            writer.write_all(b"streams").unwrap();
        });

        let mut contents = String::new();
        reader.read_to_string(&mut contents).unwrap();
        producer.join().unwrap();
        assert_eq!(contents, "hello streams");
    }

    #[test]
    fn streams_accept_only_once_and_unknown_ids_fail() {
        let hub = ChannelStreamHub::new();
        let (stream_id, _writer) = hub.open_out_stream();
        assert!(hub.accept_in_stream(stream_id).is_ok());
        assert!(hub.accept_in_stream(stream_id).is_err());
        assert!(hub.accept_in_stream(9999).is_err());
    }
}
