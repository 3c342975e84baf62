//! Message passing between partition workers.
//!
//! Every partition runs on its own thread and owns one [`Communicator`]. No
//! memory is shared between partitions: ghost mirrors, partial sums and
//! status votes all travel as messages over `crossbeam-channel`. All ranks
//! execute the same sequence of collectives, so each collective is tagged
//! with a sequence number and early arrivals are stashed until asked for.

use std::collections::HashMap;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::LandscapeError;
use crate::mesh::PartitionMesh;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduce {
    Sum,
    Min,
    Max,
}

impl Reduce {
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Reduce::Sum => a + b,
            Reduce::Min => a.min(b),
            Reduce::Max => a.max(b),
        }
    }
}

#[derive(Debug)]
enum Payload {
    Values(Vec<f64>),
    Status(Option<LandscapeError>),
    Abort(String),
}

#[derive(Debug)]
struct Envelope {
    from: usize,
    seq: u64,
    payload: Payload,
}

pub struct Communicator {
    rank: usize,
    size: usize,
    peers: Vec<Option<Sender<Envelope>>>,
    inbox: Receiver<Envelope>,
    stash: HashMap<(usize, u64), Payload>,
    seq: u64,
    aborted: bool,
}

impl Communicator {
    /// Wire up `size` fully connected communicators, one per partition.
    pub fn group(size: usize) -> Vec<Communicator> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Communicator {
                rank,
                size,
                peers: senders
                    .iter()
                    .enumerate()
                    .map(|(peer, tx)| (peer != rank).then(|| tx.clone()))
                    .collect(),
                inbox,
                stash: HashMap::new(),
                seq: 0,
                aborted: false,
            })
            .collect()
    }

    /// Communicator for a run with a single partition.
    pub fn solo() -> Communicator {
        let mut group = Self::group(1);
        group.remove(0)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn send(&self, to: usize, seq: u64, payload: Payload) -> Result<(), LandscapeError> {
        let Some(Some(tx)) = self.peers.get(to) else {
            return Err(LandscapeError::PeerAbort {
                partition: to,
                reason: format!("partition {} has no route to {}", self.rank, to),
            });
        };
        tx.send(Envelope {
            from: self.rank,
            seq,
            payload,
        })
        .map_err(|_| LandscapeError::PeerAbort {
            partition: to,
            reason: "peer channel closed".to_string(),
        })
    }

    fn recv(&mut self, from: usize, seq: u64) -> Result<Payload, LandscapeError> {
        if let Some(payload) = self.stash.remove(&(from, seq)) {
            return Ok(payload);
        }
        loop {
            match self.inbox.recv() {
                Ok(Envelope {
                    from: origin,
                    payload: Payload::Abort(reason),
                    ..
                }) => {
                    self.aborted = true;
                    return Err(LandscapeError::PeerAbort {
                        partition: origin,
                        reason,
                    });
                }
                Ok(envelope) if envelope.from == from && envelope.seq == seq => {
                    return Ok(envelope.payload);
                }
                Ok(envelope) => {
                    self.stash
                        .insert((envelope.from, envelope.seq), envelope.payload);
                }
                Err(_) => {
                    return Err(LandscapeError::PeerAbort {
                        partition: from,
                        reason: "peer channel disconnected".to_string(),
                    });
                }
            }
        }
    }

    fn recv_values(&mut self, from: usize, seq: u64) -> Result<Vec<f64>, LandscapeError> {
        match self.recv(from, seq)? {
            Payload::Values(values) => Ok(values),
            other => Err(LandscapeError::PeerAbort {
                partition: from,
                reason: format!("expected values, received {other:?}"),
            }),
        }
    }

    /// Point-to-point exchange with a symmetric set of neighbors. The result
    /// is aligned with `outgoing`: entry `i` holds what `outgoing[i].0` sent,
    /// which must be exactly `expected[i]` values long.
    pub fn exchange(
        &mut self,
        outgoing: Vec<(usize, Vec<f64>)>,
        expected: &[usize],
    ) -> Result<Vec<Vec<f64>>, LandscapeError> {
        let seq = self.next_seq();
        let peers: Vec<usize> = outgoing.iter().map(|(peer, _)| *peer).collect();
        for (peer, values) in outgoing {
            self.send(peer, seq, Payload::Values(values))?;
        }
        peers
            .into_iter()
            .zip(expected)
            .map(|(peer, &width)| {
                let values = self.recv_values(peer, seq)?;
                if values.len() != width {
                    return Err(length_mismatch(peer, width, values.len()));
                }
                Ok(values)
            })
            .collect()
    }

    /// Element-wise reduction over all partitions, folded in rank order so
    /// every partition obtains bit-identical results.
    pub fn all_reduce_many(
        &mut self,
        values: &[f64],
        op: Reduce,
    ) -> Result<Vec<f64>, LandscapeError> {
        let seq = self.next_seq();
        for peer in 0..self.size {
            if peer != self.rank {
                self.send(peer, seq, Payload::Values(values.to_vec()))?;
            }
        }
        let mut result: Option<Vec<f64>> = None;
        for peer in 0..self.size {
            let contribution = if peer == self.rank {
                values.to_vec()
            } else {
                self.recv_values(peer, seq)?
            };
            if contribution.len() != values.len() {
                return Err(length_mismatch(peer, values.len(), contribution.len()));
            }
            result = Some(match result {
                None => contribution,
                Some(acc) => acc
                    .iter()
                    .zip(&contribution)
                    .map(|(&a, &b)| op.apply(a, b))
                    .collect(),
            });
        }
        Ok(result.unwrap_or_default())
    }

    pub fn all_reduce(&mut self, value: f64, op: Reduce) -> Result<f64, LandscapeError> {
        let reduced = self.all_reduce_many(&[value], op)?;
        Ok(reduced.first().copied().unwrap_or(value))
    }

    /// Every partition's `values`, in rank order. Contributions may differ
    /// in length.
    pub fn all_gather(&mut self, values: Vec<f64>) -> Result<Vec<Vec<f64>>, LandscapeError> {
        let seq = self.next_seq();
        for peer in 0..self.size {
            if peer != self.rank {
                self.send(peer, seq, Payload::Values(values.clone()))?;
            }
        }
        let mut own = Some(values);
        let mut gathered = Vec::with_capacity(self.size);
        for peer in 0..self.size {
            if peer == self.rank {
                gathered.push(own.take().unwrap_or_default());
            } else {
                gathered.push(self.recv_values(peer, seq)?);
            }
        }
        Ok(gathered)
    }

    /// Collective OR.
    pub fn any(&mut self, flag: bool) -> Result<bool, LandscapeError> {
        let max = self.all_reduce(if flag { 1.0 } else { 0.0 }, Reduce::Max)?;
        Ok(max > 0.5)
    }

    /// Share every partition's status; all partitions return the error of the
    /// lowest failing rank, or `Ok` when every partition succeeded.
    pub fn agree(&mut self, status: Result<(), LandscapeError>) -> Result<(), LandscapeError> {
        let seq = self.next_seq();
        let local = status.err();
        for peer in 0..self.size {
            if peer != self.rank {
                self.send(peer, seq, Payload::Status(local.clone()))?;
            }
        }
        let mut first = None;
        for peer in 0..self.size {
            let verdict = if peer == self.rank {
                local.clone()
            } else {
                match self.recv(peer, seq)? {
                    Payload::Status(verdict) => verdict,
                    other => {
                        return Err(LandscapeError::PeerAbort {
                            partition: peer,
                            reason: format!("expected status, received {other:?}"),
                        })
                    }
                }
            };
            if first.is_none() {
                first = verdict;
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Tell every other partition to stop. Best effort: peers that already
    /// exited are skipped.
    pub fn abort(&mut self, reason: &str) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        for (peer, tx) in self.peers.iter().enumerate() {
            if let Some(tx) = tx {
                if tx
                    .send(Envelope {
                        from: self.rank,
                        seq: 0,
                        payload: Payload::Abort(reason.to_string()),
                    })
                    .is_err()
                {
                    tracing::debug!(
                        target: "landscape::comm",
                        rank = self.rank,
                        peer,
                        "comm.abort_undeliverable"
                    );
                }
            }
        }
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if thread::panicking() {
            self.abort("partition worker panicked");
        }
    }
}

/// Run `worker` once per partition, each on its own scoped thread.
pub fn launch<T, F>(partitions: usize, worker: F) -> Result<Vec<T>, LandscapeError>
where
    T: Send,
    F: Fn(Communicator) -> T + Sync,
{
    let comms = Communicator::group(partitions);
    thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let worker = &worker;
                scope.spawn(move || worker(comm))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle.join().map_err(|_| LandscapeError::PeerAbort {
                    partition: rank,
                    reason: "partition worker panicked".to_string(),
                })
            })
            .collect()
    })
}

/// Ghost-vertex exchange for one partition.
pub struct Halo<'a> {
    mesh: &'a PartitionMesh,
    comm: &'a mut Communicator,
}

impl<'a> Halo<'a> {
    pub fn new(mesh: &'a PartitionMesh, comm: &'a mut Communicator) -> Self {
        Self { mesh, comm }
    }

    pub fn mesh(&self) -> &'a PartitionMesh {
        self.mesh
    }

    pub fn comm(&mut self) -> &mut Communicator {
        self.comm
    }

    /// Overwrite ghost slots of every field with the owners' current values.
    pub fn refresh(&mut self, fields: &mut [&mut [f64]]) -> Result<(), LandscapeError> {
        let peers = &self.mesh.halo().peers;
        let outgoing = peers
            .iter()
            .map(|peer| {
                let values = fields
                    .iter()
                    .flat_map(|field| peer.send.iter().map(move |&v| field[v as usize]))
                    .collect();
                (peer.rank, values)
            })
            .collect();
        let expected: Vec<usize> = peers.iter().map(|p| p.recv.len() * fields.len()).collect();
        let incoming = self.comm.exchange(outgoing, &expected)?;
        for (peer, values) in peers.iter().zip(incoming) {
            let width = peer.recv.len();
            for (field, chunk) in fields.iter_mut().zip(values.chunks(width.max(1))) {
                for (&slot, &value) in peer.recv.iter().zip(chunk) {
                    field[slot as usize] = value;
                }
            }
        }
        Ok(())
    }

    /// Send the values held in ghost slots to their owners and return, per
    /// field, the sum each owned vertex received (indexed by owned vertex).
    pub fn push_to_owners(&mut self, fields: &[&[f64]]) -> Result<Vec<Vec<f64>>, LandscapeError> {
        let peers = &self.mesh.halo().peers;
        let outgoing = peers
            .iter()
            .map(|peer| {
                let values = fields
                    .iter()
                    .flat_map(|field| peer.recv.iter().map(move |&v| field[v as usize]))
                    .collect();
                (peer.rank, values)
            })
            .collect();
        let expected: Vec<usize> = peers.iter().map(|p| p.send.len() * fields.len()).collect();
        let incoming = self.comm.exchange(outgoing, &expected)?;
        let mut received = vec![vec![0.0; self.mesh.owned_count()]; fields.len()];
        for (peer, values) in peers.iter().zip(incoming) {
            let width = peer.send.len();
            for (sums, chunk) in received.iter_mut().zip(values.chunks(width.max(1))) {
                for (&slot, &value) in peer.send.iter().zip(chunk) {
                    sums[slot as usize] += value;
                }
            }
        }
        Ok(received)
    }

    pub fn max_all(&mut self, value: f64) -> Result<f64, LandscapeError> {
        self.comm.all_reduce(value, Reduce::Max)
    }

    pub fn sum_all(&mut self, value: f64) -> Result<f64, LandscapeError> {
        self.comm.all_reduce(value, Reduce::Sum)
    }
}

fn length_mismatch(peer: usize, expected: usize, found: usize) -> LandscapeError {
    LandscapeError::PeerAbort {
        partition: peer,
        reason: format!("message carried {found} values, expected {expected}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::GlobalMesh;

    #[test]
    fn all_reduce_is_rank_ordered() {
        let results = launch(4, |mut comm| {
            let rank = comm.rank() as f64;
            let sum = comm.all_reduce(rank + 0.5, Reduce::Sum).expect("sum");
            let min = comm.all_reduce(rank, Reduce::Min).expect("min");
            let max = comm.all_reduce(rank, Reduce::Max).expect("max");
            (sum, min, max)
        })
        .expect("launch");
        for (sum, min, max) in results {
            assert_eq!(sum, 8.0);
            assert_eq!(min, 0.0);
            assert_eq!(max, 3.0);
        }
    }

    #[test]
    fn reduction_rejects_mismatched_contributions() {
        let results = launch(2, |mut comm| {
            let values = vec![1.0; comm.rank() + 1];
            comm.all_reduce_many(&values, Reduce::Sum)
        })
        .expect("launch");
        assert!(matches!(
            results[0],
            Err(LandscapeError::PeerAbort { partition: 1, .. })
        ));
        assert!(matches!(
            results[1],
            Err(LandscapeError::PeerAbort { partition: 0, .. })
        ));
    }

    #[test]
    fn gather_keeps_rank_order_and_lengths() {
        let results = launch(3, |mut comm| {
            let rank = comm.rank();
            comm.all_gather(vec![rank as f64; rank])
        })
        .expect("launch");
        for gathered in results {
            let gathered = gathered.expect("gather");
            assert_eq!(gathered, vec![vec![], vec![1.0], vec![2.0, 2.0]]);
        }
    }

    #[test]
    fn agree_reports_lowest_failing_rank() {
        let results = launch(3, |mut comm| {
            let status = if comm.rank() >= 1 {
                Err(LandscapeError::PeerAbort {
                    partition: comm.rank(),
                    reason: "test".to_string(),
                })
            } else {
                Ok(())
            };
            comm.agree(status)
        })
        .expect("launch");
        for result in results {
            assert!(matches!(
                result,
                Err(LandscapeError::PeerAbort { partition: 1, .. })
            ));
        }
    }

    #[test]
    fn abort_unblocks_waiting_peers() {
        let results = launch(2, |mut comm| {
            if comm.rank() == 1 {
                comm.abort("stop");
                return None;
            }
            Some(comm.any(false))
        })
        .expect("launch");
        assert!(matches!(
            results[0],
            Some(Err(LandscapeError::PeerAbort { partition: 1, .. }))
        ));
    }

    #[test]
    fn halo_refresh_and_owner_push() {
        let mesh = GlobalMesh::regular_grid(4, 2, 1.0).expect("grid");
        let assignment = vec![0, 0, 1, 1, 0, 0, 1, 1];
        let parts = mesh.partition(&assignment).expect("partition");

        let results = launch(2, |mut comm| {
            let part = &parts[comm.rank()];
            let mut ids: Vec<f64> = (0..part.len())
                .map(|v| {
                    if part.is_owned(v) {
                        part.global_id(v) as f64
                    } else {
                        -1.0
                    }
                })
                .collect();
            let mut halo = Halo::new(part, &mut comm);
            halo.refresh(&mut [&mut ids]).expect("refresh");

            let ones: Vec<f64> = (0..part.len())
                .map(|v| if part.is_owned(v) { 0.0 } else { 1.0 })
                .collect();
            let pushed = halo.push_to_owners(&[&ones]).expect("push");
            (ids, pushed)
        })
        .expect("launch");

        for (rank, (ids, pushed)) in results.iter().enumerate() {
            let part = &parts[rank];
            for (v, id) in ids.iter().enumerate() {
                assert_eq!(*id, part.global_id(v) as f64);
            }
            // Each owned vertex on the cut is mirrored exactly once on the peer.
            let mirrored: f64 = pushed[0].iter().sum();
            assert_eq!(mirrored, part.halo().peers[0].send.len() as f64);
        }
    }
}
