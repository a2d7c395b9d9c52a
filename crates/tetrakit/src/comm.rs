//! Coarse-grained message passing between mesh partitions.
//!
//! Ranks are whole workers (one per partition) that exchange typed buffers
//! through per-pair FIFO mailboxes. Every collective below is synthesized
//! from point-to-point sends with a count-then-move protocol and acts as a
//! barrier: a rank does not leave the call until every rank has entered it.
//!
//! Buffer alignment matters to callers: consecutive `blindsend` calls made
//! with the same destination array deliver receive buffers whose entries
//! line up index-for-index, because mailboxes are FIFO per ordered rank pair
//! and receives always drain in ascending source-rank order.

use crossbeam_channel::{Receiver, Sender, unbounded};

enum Message {
    Ints(Vec<i64>),
    Dbls(Vec<f64>),
}

/// A rank's endpoint in the partition fabric.
pub struct Comm {
    rank: usize,
    to: Vec<Sender<Message>>,
    from: Vec<Receiver<Message>>,
}

impl Comm {
    /// A one-rank fabric; all sends loop back.
    pub fn solo() -> Comm {
        Comm::fabric(1).pop().unwrap()
    }

    /// Build the full fabric and hand one endpoint per rank.
    pub fn fabric(nparts: usize) -> Vec<Comm> {
        assert!(nparts > 0, "fabric needs at least one rank");
        let mut senders: Vec<Vec<Sender<Message>>> = (0..nparts).map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<Receiver<Message>>> = (0..nparts).map(|_| Vec::new()).collect();
        // mailbox (src, dst): senders held by src, receivers held by dst,
        // pushed in src order so receives drain deterministically
        for src in 0..nparts {
            for dst in 0..nparts {
                let (tx, rx) = unbounded();
                senders[src].push(tx);
                receivers[dst].push(rx);
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (to, from))| Comm { rank, to, from })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.to.len()
    }

    /// True when more than one rank participates.
    pub fn para(&self) -> bool {
        self.size() > 1
    }

    /// True on the file-touching rank.
    pub fn once(&self) -> bool {
        self.rank == 0
    }

    fn send_ints(&self, dest: usize, buf: Vec<i64>) {
        self.to[dest]
            .send(Message::Ints(buf))
            .unwrap_or_else(|_| panic!("rank {} hung up", dest));
    }

    fn send_dbls(&self, dest: usize, buf: Vec<f64>) {
        self.to[dest]
            .send(Message::Dbls(buf))
            .unwrap_or_else(|_| panic!("rank {} hung up", dest));
    }

    fn recv_ints(&self, from: usize) -> Vec<i64> {
        match self.from[from].recv() {
            Ok(Message::Ints(buf)) => buf,
            Ok(Message::Dbls(_)) => panic!("protocol skew: expected ints from rank {from}"),
            Err(_) => panic!("rank {from} hung up"),
        }
    }

    fn recv_dbls(&self, from: usize) -> Vec<f64> {
        match self.from[from].recv() {
            Ok(Message::Dbls(buf)) => buf,
            Ok(Message::Ints(_)) => panic!("protocol skew: expected dbls from rank {from}"),
            Err(_) => panic!("rank {from} hung up"),
        }
    }

    // -- collectives ------------------------------------------------------

    pub fn allsum_int(&self, x: i64) -> i64 {
        let mut sums = vec![x];
        self.allsum_ints(&mut sums);
        sums[0]
    }

    pub fn allsum_ints(&self, xs: &mut [i64]) {
        if self.once() {
            for worker in 1..self.size() {
                for (slot, value) in self.recv_ints(worker).into_iter().enumerate() {
                    xs[slot] += value;
                }
            }
        } else {
            self.send_ints(0, xs.to_vec());
        }
        self.bcast_ints(xs);
    }

    pub fn allsum_dbl(&self, x: f64) -> f64 {
        let mut sums = vec![x];
        self.allsum_dbls(&mut sums);
        sums[0]
    }

    pub fn allsum_dbls(&self, xs: &mut [f64]) {
        if self.once() {
            for worker in 1..self.size() {
                for (slot, value) in self.recv_dbls(worker).into_iter().enumerate() {
                    xs[slot] += value;
                }
            }
        } else {
            self.send_dbls(0, xs.to_vec());
        }
        self.bcast_dbls(xs);
    }

    pub fn min_dbl(&self, x: f64) -> f64 {
        self.reduce_dbl(x, f64::min)
    }

    pub fn max_dbl(&self, x: f64) -> f64 {
        self.reduce_dbl(x, f64::max)
    }

    fn reduce_dbl(&self, x: f64, op: impl Fn(f64, f64) -> f64) -> f64 {
        let mut out = [x];
        if self.once() {
            for worker in 1..self.size() {
                out[0] = op(out[0], self.recv_dbls(worker)[0]);
            }
        } else {
            self.send_dbls(0, vec![x]);
        }
        self.bcast_dbls(&mut out);
        out[0]
    }

    pub fn all_or(&self, flag: bool) -> bool {
        self.allsum_int(i64::from(flag)) > 0
    }

    /// Broadcast from rank 0 into every rank's buffer.
    pub fn bcast_ints(&self, buf: &mut [i64]) {
        if self.once() {
            for worker in 1..self.size() {
                self.send_ints(worker, buf.to_vec());
            }
        } else {
            let incoming = self.recv_ints(0);
            buf.copy_from_slice(&incoming);
        }
    }

    pub fn bcast_dbls(&self, buf: &mut [f64]) {
        if self.once() {
            for worker in 1..self.size() {
                self.send_dbls(worker, buf.to_vec());
            }
        } else {
            let incoming = self.recv_dbls(0);
            buf.copy_from_slice(&incoming);
        }
    }

    /// For each index, the rank holding the smallest value; ties go to the
    /// lowest rank so the winner is unique and identical on every rank.
    pub fn allminwho(&self, vals: &[f64]) -> Vec<usize> {
        let n = vals.len();
        let mut who = vec![0i64; n];
        if self.once() {
            let mut best = vals.to_vec();
            for worker in 1..self.size() {
                let theirs = self.recv_dbls(worker);
                for slot in 0..n {
                    if theirs[slot] < best[slot] {
                        best[slot] = theirs[slot];
                        who[slot] = worker as i64;
                    }
                }
            }
        } else {
            self.send_dbls(0, vals.to_vec());
        }
        self.bcast_ints(&mut who);
        who.into_iter().map(|w| w as usize).collect()
    }

    /// All-gather variable-length int arrays: the concatenation (rank order)
    /// and, per stride-group, the rank it came from.
    pub fn allconcat_ints(&self, stride: usize, buf: &[i64]) -> (Vec<i64>, Vec<usize>) {
        let mut concat: Vec<i64>;
        let mut source: Vec<i64>;
        if self.once() {
            concat = buf.to_vec();
            source = vec![0; buf.len() / stride];
            for worker in 1..self.size() {
                let theirs = self.recv_ints(worker);
                source.extend(std::iter::repeat_n(worker as i64, theirs.len() / stride));
                concat.extend(theirs);
            }
            let mut header = vec![concat.len() as i64];
            self.bcast_ints(&mut header);
            self.bcast_ints(&mut concat);
            self.bcast_ints(&mut source);
        } else {
            self.send_ints(0, buf.to_vec());
            let mut header = vec![0i64];
            self.bcast_ints(&mut header);
            concat = vec![0; header[0] as usize];
            source = vec![0; header[0] as usize / stride];
            self.bcast_ints(&mut concat);
            self.bcast_ints(&mut source);
        }
        (concat, source.into_iter().map(|s| s as usize).collect())
    }

    /// All-gather variable-length double arrays; see [`Comm::allconcat_ints`].
    pub fn allconcat_dbls(&self, stride: usize, buf: &[f64]) -> (Vec<f64>, Vec<usize>) {
        let mut concat: Vec<f64>;
        let mut source: Vec<i64>;
        if self.once() {
            concat = buf.to_vec();
            source = vec![0; buf.len() / stride];
            for worker in 1..self.size() {
                let theirs = self.recv_dbls(worker);
                source.extend(std::iter::repeat_n(worker as i64, theirs.len() / stride));
                concat.extend(theirs);
            }
            let mut header = vec![concat.len() as i64];
            self.bcast_ints(&mut header);
            self.bcast_dbls(&mut concat);
            self.bcast_ints(&mut source);
        } else {
            self.send_dbls(0, buf.to_vec());
            let mut header = vec![0i64];
            self.bcast_ints(&mut header);
            concat = vec![0.0; header[0] as usize];
            source = vec![0; header[0] as usize / stride];
            self.bcast_dbls(&mut concat);
            self.bcast_ints(&mut source);
        }
        (concat, source.into_iter().map(|s| s as usize).collect())
    }

    /// Each rank posts stride-groups tagged with a destination rank and
    /// receives whatever was posted to it, concatenated in source-rank order.
    pub fn blindsend_ints(&self, dest: &[usize], buf: &[i64], stride: usize) -> Vec<i64> {
        debug_assert_eq!(dest.len() * stride, buf.len());
        for target in 0..self.size() {
            let mut outgoing = Vec::new();
            for (group, &d) in dest.iter().enumerate() {
                if d == target {
                    outgoing.extend_from_slice(&buf[group * stride..(group + 1) * stride]);
                }
            }
            self.send_ints(target, outgoing);
        }
        let mut received = Vec::new();
        for source in 0..self.size() {
            received.extend(self.recv_ints(source));
        }
        received
    }

    /// Double-typed [`Comm::blindsend_ints`].
    pub fn blindsend_dbls(&self, dest: &[usize], buf: &[f64], stride: usize) -> Vec<f64> {
        debug_assert_eq!(dest.len() * stride, buf.len());
        for target in 0..self.size() {
            let mut outgoing = Vec::new();
            for (group, &d) in dest.iter().enumerate() {
                if d == target {
                    outgoing.extend_from_slice(&buf[group * stride..(group + 1) * stride]);
                }
            }
            self.send_dbls(target, outgoing);
        }
        let mut received = Vec::new();
        for source in 0..self.size() {
            received.extend(self.recv_dbls(source));
        }
        received
    }
}

/// Run `body` once per rank on its own thread over a fresh fabric, returning
/// the per-rank results in rank order.
pub fn with_fabric<T: Send>(nparts: usize, body: impl Fn(Comm) -> T + Sync) -> Vec<T> {
    let endpoints = Comm::fabric(nparts);
    let mut slots: Vec<Option<T>> = (0..nparts).map(|_| None).collect();
    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for comm in endpoints {
            let body = &body;
            handles.push(scope.spawn(move || body(comm)));
        }
        for (slot, handle) in handles.into_iter().enumerate() {
            slots[slot] = Some(handle.join().expect("rank panicked"));
        }
    });
    slots.into_iter().map(|s| s.unwrap()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solo_allsum() {
        let comm = Comm::solo();
        assert_eq!(comm.allsum_int(7), 7);
        assert_eq!(comm.allsum_dbl(2.5), 2.5);
    }

    #[test]
    fn fabric_allsum_and_reduce() {
        let results = with_fabric(3, |comm| {
            let sum = comm.allsum_int(comm.rank() as i64 + 1);
            let min = comm.min_dbl(comm.rank() as f64);
            let max = comm.max_dbl(comm.rank() as f64);
            (sum, min, max)
        });
        for (sum, min, max) in results {
            assert_eq!(sum, 6);
            assert_eq!(min, 0.0);
            assert_eq!(max, 2.0);
        }
    }

    #[test]
    fn allminwho_breaks_ties_low() {
        let results = with_fabric(3, |comm| {
            let vals = match comm.rank() {
                0 => [3.0, 1.0, 5.0],
                1 => [2.0, 1.0, 5.0],
                _ => [2.0, 9.0, 4.0],
            };
            comm.allminwho(&vals)
        });
        for who in results {
            assert_eq!(who, vec![1, 0, 2]);
        }
    }

    #[test]
    fn allconcat_orders_by_rank() {
        let results = with_fabric(2, |comm| {
            let local: Vec<i64> = if comm.rank() == 0 {
                vec![10, 11]
            } else {
                vec![20]
            };
            comm.allconcat_ints(1, &local)
        });
        for (concat, source) in results {
            assert_eq!(concat, vec![10, 11, 20]);
            assert_eq!(source, vec![0, 0, 1]);
        }
    }

    #[test]
    fn blindsend_routes_by_destination() {
        let results = with_fabric(2, |comm| {
            // everyone posts one pair to each rank, tagged with its own rank
            let dest = vec![0, 1];
            let buf = vec![comm.rank() as i64, 100 + comm.rank() as i64];
            comm.blindsend_ints(&dest, &buf, 1)
        });
        assert_eq!(results[0], vec![0, 1]);
        assert_eq!(results[1], vec![100, 101]);
    }

    #[test]
    fn blindsend_alignment_across_calls() {
        let results = with_fabric(2, |comm| {
            let dest = vec![1 - comm.rank()];
            let ints = comm.blindsend_ints(&dest, &[comm.rank() as i64], 1);
            let dbls = comm.blindsend_dbls(&dest, &[comm.rank() as f64 * 0.5], 1);
            (ints, dbls)
        });
        assert_eq!(results[0].0, vec![1]);
        assert_eq!(results[0].1, vec![0.5]);
        assert_eq!(results[1].0, vec![0]);
        assert_eq!(results[1].1, vec![0.0]);
    }
}
