//! Synchronous data-parallel replication over local threads and channels.

use crate::{Result, VmailError};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tch::Tensor;

/// Communication between the replicas of one worker group.
///
/// Every collective fails with `VmailError::Distributed` once a peer it
/// waits on has gone away.
pub trait ReplicaBackend: Send {
    /// Replace every tensor with its sum over all replicas.
    fn all_reduce_sum(&self, tensors: &mut [Tensor]) -> Result<()>;

    /// Copy rank 0's values into every other replica's tensors, in place.
    fn broadcast(&self, tensors: &[Tensor]) -> Result<()>;

    fn barrier(&self) -> Result<()>;

    fn world_size(&self) -> usize;

    fn rank(&self) -> usize;

    /// The single replica allowed to perform logging side effects.
    fn is_leader(&self) -> bool {
        self.rank() == 0
    }
}

/// Single-replica backend; every collective is the identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalBackend;

impl ReplicaBackend for LocalBackend {
    fn all_reduce_sum(&self, _tensors: &mut [Tensor]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _tensors: &[Tensor]) -> Result<()> {
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }
}

/// Channels shared by the replicas of one group.
///
/// Each rank also has a liveness channel that never carries a message. Its
/// only sender is owned by that rank's `ThreadBackend`, so the receiver
/// disconnects as soon as the replica is dropped.
pub struct SyncGroup {
    // Workers send to rank 0 on `reduce`, rank 0 answers on `bcast`
    reduce_senders: Vec<Sender<Vec<Tensor>>>,
    reduce_receivers: Vec<Receiver<Vec<Tensor>>>,
    bcast_senders: Vec<Sender<Vec<Tensor>>>,
    bcast_receivers: Vec<Receiver<Vec<Tensor>>>,
    alive: Vec<Receiver<()>>,
    alive_tokens: Mutex<Vec<Option<Sender<()>>>>,
}

impl SyncGroup {
    pub fn new(world_size: usize) -> Arc<Self> {
        let mut reduce_senders = Vec::with_capacity(world_size);
        let mut reduce_receivers = Vec::with_capacity(world_size);
        let mut bcast_senders = Vec::with_capacity(world_size);
        let mut bcast_receivers = Vec::with_capacity(world_size);
        let mut alive = Vec::with_capacity(world_size);
        let mut alive_tokens = Vec::with_capacity(world_size);

        for _ in 0..world_size {
            let (rs, rr) = bounded(1);
            let (bs, br) = bounded(1);
            let (token, watch) = bounded(0);
            reduce_senders.push(rs);
            reduce_receivers.push(rr);
            bcast_senders.push(bs);
            bcast_receivers.push(br);
            alive.push(watch);
            alive_tokens.push(Some(token));
        }

        Arc::new(Self {
            reduce_senders,
            reduce_receivers,
            bcast_senders,
            bcast_receivers,
            alive,
            alive_tokens: Mutex::new(alive_tokens),
        })
    }

    pub fn world_size(&self) -> usize {
        self.reduce_senders.len()
    }

    fn take_token(&self, rank: usize) -> Option<Sender<()>> {
        self.alive_tokens
            .lock()
            .ok()
            .and_then(|mut tokens| tokens.get_mut(rank).and_then(Option::take))
    }
}

fn peer_gone(peer: usize) -> VmailError {
    VmailError::Distributed(format!("replica {} is gone", peer))
}

fn deep_copy(tensors: &[Tensor]) -> Vec<Tensor> {
    tensors.iter().map(|t| t.detach().copy()).collect()
}

/// Replica of a thread-local worker group. Rank 0 performs the reductions.
pub struct ThreadBackend {
    rank: usize,
    group: Arc<SyncGroup>,
    // Dropped with the backend, which tells the peers this rank is gone
    _alive: Option<Sender<()>>,
}

impl ThreadBackend {
    /// Join `group` as `rank`. Only the first backend created for a rank
    /// signals that rank's liveness.
    pub fn new(rank: usize, group: Arc<SyncGroup>) -> Self {
        let alive = group.take_token(rank);
        Self {
            rank,
            group,
            _alive: alive,
        }
    }

    fn send_to(
        &self,
        peer: usize,
        tx: &Sender<Vec<Tensor>>,
        tensors: Vec<Tensor>,
    ) -> Result<()> {
        select! {
            send(tx, tensors) -> sent => sent.map_err(|_| peer_gone(peer)),
            recv(self.group.alive[peer]) -> _ => Err(peer_gone(peer)),
        }
    }

    fn recv_from(&self, peer: usize, rx: &Receiver<Vec<Tensor>>) -> Result<Vec<Tensor>> {
        select! {
            recv(rx) -> msg => msg.map_err(|_| peer_gone(peer)),
            // A message sent just before the peer exited is still valid
            recv(self.group.alive[peer]) -> _ => rx.try_recv().map_err(|_| peer_gone(peer)),
        }
    }
}

impl ReplicaBackend for ThreadBackend {
    fn all_reduce_sum(&self, tensors: &mut [Tensor]) -> Result<()> {
        let ws = self.group.world_size();
        if ws <= 1 {
            return Ok(());
        }

        if self.rank == 0 {
            let mut sums: Vec<Tensor> = tensors.iter().map(|t| t.detach()).collect();
            for i in 1..ws {
                let theirs = self.recv_from(i, &self.group.reduce_receivers[i])?;
                if theirs.len() != sums.len() {
                    return Err(VmailError::Distributed(format!(
                        "rank {} sent {} tensors, expected {}",
                        i,
                        theirs.len(),
                        sums.len()
                    )));
                }
                sums = sums
                    .iter()
                    .zip(theirs)
                    .map(|(s, t)| s + t.to_device(s.device()))
                    .collect();
            }
            for i in 1..ws {
                self.send_to(i, &self.group.bcast_senders[i], deep_copy(&sums))?;
            }
            for (t, s) in tensors.iter_mut().zip(sums) {
                *t = s;
            }
        } else {
            self.send_to(0, &self.group.reduce_senders[self.rank], deep_copy(tensors))?;
            let sums = self.recv_from(0, &self.group.bcast_receivers[self.rank])?;
            for (t, s) in tensors.iter_mut().zip(sums) {
                *t = s.to_device(t.device());
            }
        }
        Ok(())
    }

    fn broadcast(&self, tensors: &[Tensor]) -> Result<()> {
        let ws = self.group.world_size();
        if ws <= 1 {
            return Ok(());
        }

        if self.rank == 0 {
            for i in 1..ws {
                self.send_to(i, &self.group.bcast_senders[i], deep_copy(tensors))?;
            }
        } else {
            let values = self.recv_from(0, &self.group.bcast_receivers[self.rank])?;
            tch::no_grad(|| -> Result<()> {
                for (t, v) in tensors.iter().zip(values) {
                    t.shallow_clone().f_copy_(&v.to_device(t.device()))?;
                }
                Ok(())
            })?;
        }
        self.barrier()
    }

    /// Every worker checks in with rank 0, which then releases them all.
    fn barrier(&self) -> Result<()> {
        let ws = self.group.world_size();
        if ws <= 1 {
            return Ok(());
        }
        if self.rank == 0 {
            for i in 1..ws {
                self.recv_from(i, &self.group.reduce_receivers[i])?;
            }
            for i in 1..ws {
                self.send_to(i, &self.group.bcast_senders[i], Vec::new())?;
            }
        } else {
            self.send_to(0, &self.group.reduce_senders[self.rank], Vec::new())?;
            self.recv_from(0, &self.group.bcast_receivers[self.rank])?;
        }
        Ok(())
    }

    fn world_size(&self) -> usize {
        self.group.world_size()
    }

    fn rank(&self) -> usize {
        self.rank
    }
}

/// Work a replica thread performs on request from the leader.
pub trait ReplicaWorker {
    /// Run `steps` training steps in lockstep with the leader.
    fn train(&mut self, steps: u64) -> Result<()>;

    /// Take part in a parameter broadcast from rank 0.
    fn synchronize(&mut self) -> Result<()>;
}

enum PoolCommand {
    Train(u64),
    Synchronize,
}

/// Fixed-size pool of replica threads (ranks `1..world_size`). The calling
/// thread is rank 0 and must issue the same collectives as the workers.
pub struct ReplicaPool {
    commands: Vec<Sender<PoolCommand>>,
    done: Receiver<Result<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl ReplicaPool {
    /// Spawn `group.world_size() - 1` workers. `factory` runs on each worker
    /// thread to build its replica, so tensors never cross threads at start.
    pub fn spawn<W, F>(group: &Arc<SyncGroup>, factory: F) -> Result<Self>
    where
        W: ReplicaWorker,
        F: Fn(ThreadBackend) -> Result<W> + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let (done_tx, done) = bounded(group.world_size());
        let mut commands = Vec::new();
        let mut handles = Vec::new();

        for rank in 1..group.world_size() {
            let (tx, rx) = bounded::<PoolCommand>(1);
            let factory = Arc::clone(&factory);
            let group = Arc::clone(group);
            let done_tx = done_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("replica-{}", rank))
                .spawn(move || {
                    let mut worker = match factory(ThreadBackend::new(rank, group)) {
                        Ok(worker) => worker,
                        Err(e) => {
                            tracing::error!(rank, error = %e, "replica failed to start");
                            let _ = done_tx.send(Err(e));
                            return;
                        }
                    };
                    for command in rx.iter() {
                        let result = match command {
                            PoolCommand::Train(steps) => worker.train(steps),
                            PoolCommand::Synchronize => worker.synchronize(),
                        };
                        if let Err(e) = &result {
                            tracing::error!(rank, error = %e, "replica step failed");
                        }
                        let failed = result.is_err();
                        if done_tx.send(result).is_err() || failed {
                            return;
                        }
                    }
                })?;
            commands.push(tx);
            handles.push(handle);
        }

        Ok(Self {
            commands,
            done,
            handles,
        })
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn dispatch(&self, make: impl Fn() -> PoolCommand) -> Result<()> {
        for tx in &self.commands {
            tx.send(make())
                .map_err(|_| VmailError::Distributed("replica thread exited".into()))?;
        }
        Ok(())
    }

    /// Ask every worker to train `steps` steps. The leader must then run the
    /// same number of steps itself and call [`ReplicaPool::wait`].
    pub fn start_train(&self, steps: u64) -> Result<()> {
        self.dispatch(|| PoolCommand::Train(steps))
    }

    /// Ask every worker to receive rank 0's parameters.
    pub fn start_synchronize(&self) -> Result<()> {
        self.dispatch(|| PoolCommand::Synchronize)
    }

    /// Wait for every worker to finish its current command.
    pub fn wait(&self) -> Result<()> {
        for _ in 0..self.commands.len() {
            self.done
                .recv()
                .map_err(|_| VmailError::Distributed("replica thread exited".into()))??;
        }
        Ok(())
    }

    /// The first error a worker has already reported, if any. Used by the
    /// leader to explain why one of its own collectives failed.
    pub fn failure(&self) -> Option<VmailError> {
        self.done.try_iter().find_map(|result| result.err())
    }

    /// Close the command channels and wait for every worker to exit.
    pub fn join(mut self) -> Result<()> {
        self.commands.clear();
        for handle in std::mem::take(&mut self.handles) {
            handle
                .join()
                .map_err(|_| VmailError::Distributed("replica thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for ReplicaPool {
    // Threads still running are detached rather than joined; they exit once
    // their next collective sees the leader's backend dropped.
    fn drop(&mut self) {
        self.commands.clear();
    }
}
