//! Transmit-buffer ring between the scoring side and the communication
//! thread. Two encode buffers rotate through a pair of bounded channels,
//! so a buffer is owned either by the producer (being filled) or by the
//! consumer (being shipped), never both.

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::codec::{PartialRecord, TAIL_SAMPLES};
use crate::error::EngineError;

/// Number of transmit buffers in rotation.
pub const TX_BUFFERS: usize = 2;

/// One batch worth of encoded partial results.
#[derive(Clone, Debug)]
pub struct EncodeBuffer {
    pub batch_num: usize,
    pub records: Vec<(PartialRecord, [u16; TAIL_SAMPLES])>,
}

impl EncodeBuffer {
    fn with_capacity(slots: usize) -> Self {
        Self {
            batch_num: 0,
            records: Vec::with_capacity(slots),
        }
    }

    pub fn clear(&mut self) {
        self.batch_num = 0;
        self.records.clear();
    }
}

/// Scratch space for one batch of incoming payload groups, reused across
/// exchanges so the receive path allocates once.
#[derive(Debug, Default)]
pub struct RxBuffer {
    pub groups: Vec<Vec<u8>>,
}

impl RxBuffer {
    pub fn new(nodes: usize) -> Self {
        Self {
            groups: vec![Vec::new(); nodes],
        }
    }

    pub fn clear(&mut self) {
        for group in &mut self.groups {
            group.clear();
        }
    }
}

/// Filling side of the ring, held by the search manager.
pub struct TxProducer {
    free: Receiver<EncodeBuffer>,
    full: Sender<EncodeBuffer>,
}

/// Draining side of the ring, held by the communication thread.
pub struct TxConsumer {
    full: Receiver<EncodeBuffer>,
    free: Sender<EncodeBuffer>,
}

/// Build the transmit ring with [`TX_BUFFERS`] buffers sized for `slots`
/// encoded tails each.
pub fn tx_ring(slots: usize) -> (TxProducer, TxConsumer) {
    let (free_tx, free_rx) = bounded(TX_BUFFERS);
    let (full_tx, full_rx) = bounded(TX_BUFFERS);
    for _ in 0..TX_BUFFERS {
        free_tx
            .send(EncodeBuffer::with_capacity(slots))
            .expect("fresh ring cannot be full");
    }
    (
        TxProducer {
            free: free_rx,
            full: full_tx,
        },
        TxConsumer {
            full: full_rx,
            free: free_tx,
        },
    )
}

impl TxProducer {
    /// Block until a buffer is free for filling.
    pub fn acquire(&self) -> Result<EncodeBuffer, EngineError> {
        self.free
            .recv()
            .map_err(|_| EngineError::TransferFailure("communication thread gone".into()))
    }

    /// Hand a filled buffer to the communication thread.
    pub fn submit(&self, buffer: EncodeBuffer) -> Result<(), EngineError> {
        self.full
            .send(buffer)
            .map_err(|_| EngineError::TransferFailure("communication thread gone".into()))
    }
}

impl TxConsumer {
    /// Next filled buffer, or `None` once the producer is dropped and the
    /// ring has drained.
    pub fn next(&self) -> Option<EncodeBuffer> {
        self.full.recv().ok()
    }

    /// Return a drained buffer to the free pool.
    pub fn release(&self, mut buffer: EncodeBuffer) {
        buffer.clear();
        // The producer may already have shut down; the buffer just drops.
        let _ = self.free.send(buffer);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ring_rotates_two_buffers() {
        let (producer, consumer) = tx_ring(4);

        let mut a = producer.acquire().unwrap();
        a.batch_num = 1;
        producer.submit(a).unwrap();

        let mut b = producer.acquire().unwrap();
        b.batch_num = 2;
        producer.submit(b).unwrap();

        // Both buffers are in flight; consumer sees them in order
        let got = consumer.next().unwrap();
        assert_eq!(got.batch_num, 1);
        consumer.release(got);

        // Released buffer is immediately reusable
        let c = producer.acquire().unwrap();
        assert!(c.records.is_empty());

        let got = consumer.next().unwrap();
        assert_eq!(got.batch_num, 2);
    }

    #[test]
    fn consumer_drains_after_producer_drops() {
        let (producer, consumer) = tx_ring(1);
        let buffer = producer.acquire().unwrap();
        producer.submit(buffer).unwrap();
        drop(producer);

        assert!(consumer.next().is_some());
        assert!(consumer.next().is_none());
    }

    #[test]
    fn producer_blocks_until_release() {
        use std::time::Duration;

        let (producer, consumer) = tx_ring(1);
        producer.submit(producer.acquire().unwrap()).unwrap();
        producer.submit(producer.acquire().unwrap()).unwrap();

        // Ring is exhausted; acquire must block until the consumer releases
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let buffer = consumer.next().unwrap();
            consumer.release(buffer);
            consumer
        });
        let buffer = producer.acquire().unwrap();
        assert!(buffer.records.is_empty());
        handle.join().unwrap();
    }
}
