//! Distributed partial-result exchange. Every node scores every spectrum
//! against its shard of the database; per-spectrum histogram tails are then
//! shuffled so the owner of each spectrum can rebuild the full score
//! distribution and fit the global E-value.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use fnv::FnvHashMap;

use crate::buffers::{EncodeBuffer, RxBuffer};
use crate::codec::{self, RECORD_BYTES, TAIL_BYTES};
use crate::config::DistPolicy;
use crate::error::EngineError;
use crate::survival::PartialSurvival;

/// Pairwise message transport between the nodes of a search. Both phases
/// are collective: every node participates in every call, in lockstep per
/// batch.
pub trait Transport: Send {
    fn nodes(&self) -> usize;

    fn myid(&self) -> usize;

    /// All-to-all exchange of per-destination record counts.
    /// `tx[j]` is the number of records this node will forward to node `j`;
    /// the returned vector holds the counts each node will forward to us.
    fn exchange_sizes(&mut self, tx: &[i32]) -> Result<Vec<i32>, EngineError>;

    /// All-to-all exchange of serialized record groups. `outgoing[j]` is
    /// the payload for node `j`; received payloads land in `rx.groups`.
    fn exchange_payloads(
        &mut self,
        outgoing: &[Vec<u8>],
        rx: &mut RxBuffer,
    ) -> Result<(), EngineError>;
}

/// In-process mesh over crossbeam channels. Used by tests and by
/// single-host multi-node runs.
pub struct ChannelMesh {
    myid: usize,
    to_peer: Vec<Option<Sender<Vec<u8>>>>,
    from_peer: Vec<Option<Receiver<Vec<u8>>>>,
}

impl ChannelMesh {
    /// Build a fully connected mesh of `nodes` endpoints.
    pub fn mesh(nodes: usize) -> Vec<ChannelMesh> {
        let mut endpoints = (0..nodes)
            .map(|myid| ChannelMesh {
                myid,
                to_peer: (0..nodes).map(|_| None).collect(),
                from_peer: (0..nodes).map(|_| None).collect(),
            })
            .collect::<Vec<_>>();

        for i in 0..nodes {
            for j in 0..nodes {
                if i == j {
                    continue;
                }
                let (tx, rx) = unbounded();
                endpoints[i].to_peer[j] = Some(tx);
                endpoints[j].from_peer[i] = Some(rx);
            }
        }
        endpoints
    }

    fn send(&self, peer: usize, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.to_peer[peer]
            .as_ref()
            .expect("no channel to self")
            .send(bytes)
            .map_err(|_| EngineError::TransferFailure(format!("node {} hung up", peer)))
    }

    fn recv(&self, peer: usize) -> Result<Vec<u8>, EngineError> {
        self.from_peer[peer]
            .as_ref()
            .expect("no channel to self")
            .recv()
            .map_err(|_| EngineError::TransferFailure(format!("node {} hung up", peer)))
    }
}

impl Transport for ChannelMesh {
    fn nodes(&self) -> usize {
        self.to_peer.len()
    }

    fn myid(&self) -> usize {
        self.myid
    }

    fn exchange_sizes(&mut self, tx: &[i32]) -> Result<Vec<i32>, EngineError> {
        let nodes = self.nodes();
        let mut rx = vec![0i32; nodes];
        for peer in 0..nodes {
            if peer != self.myid {
                self.send(peer, tx[peer].to_le_bytes().to_vec())?;
            }
        }
        for peer in 0..nodes {
            if peer == self.myid {
                continue;
            }
            let bytes = self.recv(peer)?;
            if bytes.len() != 4 {
                return Err(EngineError::TransferFailure("bad size record".into()));
            }
            rx[peer] = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        Ok(rx)
    }

    fn exchange_payloads(
        &mut self,
        outgoing: &[Vec<u8>],
        rx: &mut RxBuffer,
    ) -> Result<(), EngineError> {
        rx.clear();
        for peer in 0..self.nodes() {
            if peer != self.myid {
                self.send(peer, outgoing[peer].clone())?;
            }
        }
        for peer in 0..self.nodes() {
            if peer != self.myid {
                rx.groups[peer] = self.recv(peer)?;
            }
        }
        Ok(())
    }
}

/// Full-mesh TCP transport. Node `i` listens on `addrs[i]`; lower-id nodes
/// dial higher-id nodes. Frames are length-prefixed.
pub struct TcpMesh {
    myid: usize,
    streams: Vec<Option<TcpStream>>,
}

impl TcpMesh {
    pub fn connect(myid: usize, addrs: &[String]) -> Result<Self, EngineError> {
        let nodes = addrs.len();
        if myid >= nodes {
            return Err(EngineError::InvalidParam("myid outside address list"));
        }
        let listener = TcpListener::bind(&addrs[myid])?;
        let mut streams: Vec<Option<TcpStream>> = (0..nodes).map(|_| None).collect();

        // Dial every lower-id peer, retrying while it comes up
        for (peer, addr) in addrs.iter().enumerate().take(myid) {
            let mut attempts = 0;
            let stream = loop {
                match TcpStream::connect(addr) {
                    Ok(stream) => break stream,
                    Err(e) if attempts < 100 => {
                        attempts += 1;
                        log::trace!("waiting for node {} ({}): {}", peer, addr, e);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    Err(e) => {
                        return Err(EngineError::TransferFailure(format!(
                            "cannot reach node {} at {}: {}",
                            peer, addr, e
                        )))
                    }
                }
            };
            let mut stream = stream;
            stream.write_all(&(myid as u32).to_le_bytes())?;
            stream.set_nodelay(true)?;
            streams[peer] = Some(stream);
        }

        // Accept one connection from every higher-id peer
        for _ in myid + 1..nodes {
            let (mut stream, _) = listener.accept()?;
            let mut id = [0u8; 4];
            stream.read_exact(&mut id)?;
            let peer = u32::from_le_bytes(id) as usize;
            if peer <= myid || peer >= nodes || streams[peer].is_some() {
                return Err(EngineError::TransferFailure(format!(
                    "unexpected handshake from node {}",
                    peer
                )));
            }
            stream.set_nodelay(true)?;
            streams[peer] = Some(stream);
        }

        Ok(Self { myid, streams })
    }

    /// One lockstep round: write our frame to every peer from a background
    /// thread while draining incoming frames, so large payloads cannot
    /// deadlock on full socket buffers.
    fn round(&mut self, outgoing: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, EngineError> {
        let nodes = self.streams.len();
        let mut incoming = vec![Vec::new(); nodes];

        let mut writers = Vec::new();
        for (peer, stream) in self.streams.iter().enumerate() {
            let Some(stream) = stream else { continue };
            let mut stream = stream.try_clone()?;
            let frame = outgoing[peer].clone();
            writers.push(std::thread::spawn(move || -> std::io::Result<()> {
                stream.write_all(&(frame.len() as u32).to_le_bytes())?;
                stream.write_all(&frame)
            }));
        }

        for (peer, stream) in self.streams.iter_mut().enumerate() {
            let Some(stream) = stream else { continue };
            let mut len = [0u8; 4];
            stream.read_exact(&mut len)?;
            let mut frame = vec![0u8; u32::from_le_bytes(len) as usize];
            stream.read_exact(&mut frame)?;
            incoming[peer] = frame;
        }

        for writer in writers {
            writer
                .join()
                .map_err(|_| EngineError::TransferFailure("writer thread panicked".into()))??;
        }
        Ok(incoming)
    }
}

impl Transport for TcpMesh {
    fn nodes(&self) -> usize {
        self.streams.len()
    }

    fn myid(&self) -> usize {
        self.myid
    }

    fn exchange_sizes(&mut self, tx: &[i32]) -> Result<Vec<i32>, EngineError> {
        let outgoing = tx
            .iter()
            .map(|count| count.to_le_bytes().to_vec())
            .collect::<Vec<_>>();
        let incoming = self.round(&outgoing)?;

        let mut rx = vec![0i32; self.nodes()];
        for (peer, bytes) in incoming.iter().enumerate() {
            if peer == self.myid {
                continue;
            }
            if bytes.len() != 4 {
                return Err(EngineError::TransferFailure("bad size record".into()));
            }
            rx[peer] = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        Ok(rx)
    }

    fn exchange_payloads(
        &mut self,
        outgoing: &[Vec<u8>],
        rx: &mut RxBuffer,
    ) -> Result<(), EngineError> {
        rx.clear();
        let incoming = self.round(outgoing)?;
        for (peer, frame) in incoming.into_iter().enumerate() {
            if peer != self.myid {
                rx.groups[peer] = frame;
            }
        }
        Ok(())
    }
}

/// Drives the per-batch scatter/gather and accumulates decoded tails for
/// the spectra this node owns.
pub struct Exchanger {
    transport: Box<dyn Transport>,
    policy: DistPolicy,
    rx: RxBuffer,
}

impl Exchanger {
    pub fn new(transport: Box<dyn Transport>, policy: DistPolicy) -> Self {
        let nodes = transport.nodes();
        Self {
            transport,
            policy,
            rx: RxBuffer::new(nodes),
        }
    }

    pub fn myid(&self) -> usize {
        self.transport.myid()
    }

    /// Size phase, payload phase, and accumulation for one scored batch.
    pub fn exchange_batch(
        &mut self,
        buffer: &EncodeBuffer,
        partials: &mut FnvHashMap<i32, PartialSurvival>,
    ) -> Result<(), EngineError> {
        let nodes = self.transport.nodes();
        let myid = self.transport.myid();

        let mut groups = vec![Vec::new(); nodes];
        let mut counts = vec![0i32; nodes];
        for (record, samples) in &buffer.records {
            let owner = self.policy.owner(record.query_id, nodes);
            if owner == myid {
                partials
                    .entry(record.query_id)
                    .or_default()
                    .accumulate(record, samples)?;
            } else {
                record.write(&mut groups[owner]);
                for sample in samples.iter() {
                    groups[owner].extend_from_slice(&sample.to_le_bytes());
                }
                counts[owner] += 1;
            }
        }

        let rx_counts = self.transport.exchange_sizes(&counts)?;
        self.transport.exchange_payloads(&groups, &mut self.rx)?;

        for peer in 0..nodes {
            if peer == myid {
                continue;
            }
            let bytes = &self.rx.groups[peer];
            let expect = rx_counts[peer] as usize * (RECORD_BYTES + TAIL_BYTES);
            if bytes.len() != expect {
                return Err(EngineError::TransferFailure(format!(
                    "node {} sent {} bytes, expected {}",
                    peer,
                    bytes.len(),
                    expect
                )));
            }
            for (record, samples) in codec::read_group(bytes)? {
                let owner = self.policy.owner(record.query_id, nodes);
                if owner != myid {
                    return Err(EngineError::TransferFailure(format!(
                        "node {} forwarded spectrum {} not owned here",
                        peer, record.query_id
                    )));
                }
                partials
                    .entry(record.query_id)
                    .or_default()
                    .accumulate(&record, samples.as_slice())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::encode_tail;
    use crate::survival::HISTOGRAM_BINS;

    fn tail(bins: &[(usize, f64)], cpsms: u32, max: f32, qid: i32) -> EncodeBuffer {
        let mut yy = vec![0.0; HISTOGRAM_BINS];
        for &(bin, count) in bins {
            yy[bin] = count;
        }
        let mut buffer = EncodeBuffer {
            batch_num: 0,
            records: Vec::new(),
        };
        buffer.records.push(encode_tail(&yy, cpsms, max, qid));
        buffer
    }

    #[test]
    fn sizes_are_symmetric() {
        let mut mesh = ChannelMesh::mesh(3);
        let c = mesh.pop().unwrap();
        let b = mesh.pop().unwrap();
        let a = mesh.pop().unwrap();

        let handles = [(a, [0, 5, 7]), (b, [2, 0, 1]), (c, [9, 4, 0])]
            .map(|(mut endpoint, tx)| {
                std::thread::spawn(move || endpoint.exchange_sizes(&tx).unwrap())
            });

        let [ra, rb, rc] = handles.map(|h| h.join().unwrap());
        assert_eq!(ra, vec![0, 2, 9]);
        assert_eq!(rb, vec![5, 0, 4]);
        assert_eq!(rc, vec![7, 1, 0]);
    }

    #[test]
    fn merged_tails_match_single_node() {
        // Node 0 and node 1 each contribute half the distribution of the
        // same (node-0-owned) spectrum
        let mut mesh = ChannelMesh::mesh(2);
        let n1 = mesh.pop().unwrap();
        let n0 = mesh.pop().unwrap();

        let shard0 = tail(&[(40, 3000.0), (41, 2000.0)], 5000, 4.1, 0);
        let shard1 = tail(&[(40, 1000.0), (42, 4000.0)], 5000, 4.2, 0);

        let worker = {
            let shard1 = shard1.clone();
            std::thread::spawn(move || {
                let mut exchanger = Exchanger::new(Box::new(n1), DistPolicy::Cyclic);
                let mut partials = FnvHashMap::default();
                exchanger.exchange_batch(&shard1, &mut partials).unwrap();
                // Node 1 owns nothing with a cyclic policy over even ids
                assert!(partials.is_empty());
            })
        };

        let mut exchanger = Exchanger::new(Box::new(n0), DistPolicy::Cyclic);
        let mut partials = FnvHashMap::default();
        exchanger.exchange_batch(&shard0, &mut partials).unwrap();
        worker.join().unwrap();

        let merged = partials.remove(&0).unwrap();
        assert_eq!(merged.psms(), 10_000);
        assert_eq!(merged.max_hyperscore(), 4.2);

        // Accumulating the same two shards locally, in the opposite order,
        // must give a bit-identical fit
        let mut reversed = PartialSurvival::new();
        for buffer in [&shard1, &shard0] {
            let (record, samples) = &buffer.records[0];
            reversed.accumulate(record, samples.as_slice()).unwrap();
        }
        assert_eq!(merged.finish(), reversed.finish());
    }

    #[test]
    fn foreign_spectrum_is_rejected() {
        let mut mesh = ChannelMesh::mesh(2);
        let n1 = mesh.pop().unwrap();
        let n0 = mesh.pop().unwrap();

        // Node 0 wrongly claims to forward spectrum 0 (owned by node 0) to
        // node 1
        let worker = std::thread::spawn(move || {
            let mut exchanger = Exchanger::new(Box::new(n1), DistPolicy::Cyclic);
            let mut partials = FnvHashMap::default();
            exchanger.exchange_batch(&tail(&[], 0, 0.0, 1), &mut partials)
        });

        let buffer = tail(&[(10, 1.0)], 1, 1.0, 0);
        let mut groups = vec![Vec::new(); 2];
        codec::write_group(&buffer.records, &mut groups[1]);
        let mut n0 = n0;
        n0.exchange_sizes(&[0, 1]).unwrap();
        let mut rx = RxBuffer::new(2);
        n0.exchange_payloads(&groups, &mut rx).unwrap();

        assert!(worker.join().unwrap().is_err());
    }
}
