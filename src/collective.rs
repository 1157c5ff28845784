//! Collective operations shared by every worker of a run.
//!
//! Every member must issue the same collectives in the same order. A member
//! that skips one leaves the others blocked forever; neither transport has a
//! timeout.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};

pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    /// Sum of `value` across all members, returned to every member.
    fn all_reduce_sum(&self, value: i64) -> Result<i64>;
    fn barrier(&self) -> Result<()>;
}

struct Round {
    arrived: usize,
    sum: i64,
    generation: u64,
    result: i64,
}

struct Shared {
    world_size: usize,
    round: Mutex<Round>,
    done: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Round> {
        self.round.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One member of a group whose workers are threads of this process.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates the group and returns one handle per rank, in rank order.
    pub fn new(world_size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(Shared {
            world_size,
            round: Mutex::new(Round {
                arrived: 0,
                sum: 0,
                generation: 0,
                result: 0,
            }),
            done: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// A group of one, for single-process runs.
    pub fn solo() -> LocalGroup {
        LocalGroup::new(1).remove(0)
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_sum(&self, value: i64) -> Result<i64> {
        let mut round = self.shared.lock();
        let generation = round.generation;
        round.sum += value;
        round.arrived += 1;
        if round.arrived == self.shared.world_size {
            round.result = round.sum;
            round.sum = 0;
            round.arrived = 0;
            round.generation += 1;
            self.shared.done.notify_all();
            return Ok(round.result);
        }
        while round.generation == generation {
            round = self
                .shared
                .done
                .wait(round)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        Ok(round.result)
    }

    fn barrier(&self) -> Result<()> {
        self.all_reduce_sum(0).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    AllReduce = 1,
    Barrier = 2,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::AllReduce => "all_reduce",
            Op::Barrier => "barrier",
        }
    }

    fn from_tag(tag: u8) -> Option<Op> {
        match tag {
            1 => Some(Op::AllReduce),
            2 => Some(Op::Barrier),
            _ => None,
        }
    }
}

const FRAME_LEN: usize = 9;

fn write_frame(stream: &mut TcpStream, op: Op, value: i64) -> Result<()> {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = op as u8;
    frame[1..].copy_from_slice(&value.to_le_bytes());
    stream.write_all(&frame)?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<(u8, i64)> {
    let mut frame = [0u8; FRAME_LEN];
    stream.read_exact(&mut frame)?;
    let mut value = [0u8; 8];
    value.copy_from_slice(&frame[1..]);
    Ok((frame[0], i64::from_le_bytes(value)))
}

enum Role {
    /// Rank 0 holds one stream per peer, indexed by `rank - 1`.
    Root(Vec<Mutex<TcpStream>>),
    Peer(Mutex<TcpStream>),
}

/// Star-shaped group over TCP: rank 0 listens at the rendezvous address,
/// reduces what the peers send and answers each of them.
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    role: Role,
}

pub struct TcpRendezvous {
    listener: TcpListener,
    world_size: usize,
}

impl TcpRendezvous {
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until every peer has connected and announced its rank.
    pub fn accept_peers(self) -> Result<TcpGroup> {
        let mut streams: Vec<Option<TcpStream>> = (1..self.world_size).map(|_| None).collect();
        while streams.iter().any(Option::is_none) {
            let (mut stream, peer) = self.listener.accept()?;
            stream.set_nodelay(true)?;
            let mut hello = [0u8; 8];
            stream.read_exact(&mut hello)?;
            let rank = u64::from_le_bytes(hello) as usize;
            match streams.get_mut(rank.wrapping_sub(1)) {
                Some(slot) if slot.is_none() => {
                    debug!("rank {} joined from {}", rank, peer);
                    *slot = Some(stream);
                }
                _ => {
                    return Err(OrchestratorError::configuration(format!(
                        "peer at {peer} announced rank {rank}, which is out of range or already taken \
                         (world size {})",
                        self.world_size
                    )))
                }
            }
        }
        info!("All {} ranks joined the process group", self.world_size);
        Ok(TcpGroup {
            rank: 0,
            world_size: self.world_size,
            role: Role::Root(streams.into_iter().flatten().map(Mutex::new).collect()),
        })
    }
}

impl TcpGroup {
    pub fn bind(addr: impl ToSocketAddrs, world_size: usize) -> Result<TcpRendezvous> {
        Ok(TcpRendezvous {
            listener: TcpListener::bind(addr)?,
            world_size,
        })
    }

    /// Connects to rank 0, retrying until it listens.
    pub fn connect(addr: impl ToSocketAddrs + Clone, rank: usize, world_size: usize) -> Result<TcpGroup> {
        let mut attempt = 0u64;
        let mut stream = loop {
            match TcpStream::connect(addr.clone()) {
                Ok(stream) => break stream,
                Err(e) => {
                    attempt += 1;
                    if attempt % 50 == 1 {
                        debug!("rank {} waiting for the coordinator: {}", rank, e);
                    }
                    thread::sleep(Duration::from_millis(100));
                }
            }
        };
        stream.set_nodelay(true)?;
        stream.write_all(&(rank as u64).to_le_bytes())?;
        Ok(TcpGroup {
            rank,
            world_size,
            role: Role::Peer(Mutex::new(stream)),
        })
    }

    /// Joins (rank 0: hosts) the group at `addr`.
    pub fn join(addr: &str, rank: usize, world_size: usize) -> Result<TcpGroup> {
        if rank == 0 {
            Self::bind(addr, world_size)?.accept_peers()
        } else {
            Self::connect(addr.to_string(), rank, world_size)
        }
    }

    fn exchange(&self, op: Op, value: i64) -> Result<i64> {
        match &self.role {
            Role::Root(peers) => {
                let mut streams: Vec<MutexGuard<'_, TcpStream>> = peers
                    .iter()
                    .map(|p| p.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
                    .collect();
                let mut sum = value;
                for (idx, stream) in streams.iter_mut().enumerate() {
                    let (tag, peer_value) = read_frame(stream)?;
                    let found = Op::from_tag(tag).map_or("unknown", Op::name);
                    if Op::from_tag(tag) != Some(op) {
                        return Err(OrchestratorError::CollectiveMismatch {
                            rank: idx + 1,
                            expected: op.name(),
                            found,
                        });
                    }
                    sum += peer_value;
                }
                for stream in streams.iter_mut() {
                    write_frame(stream, op, sum)?;
                }
                Ok(sum)
            }
            Role::Peer(stream) => {
                let mut stream = stream.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                write_frame(&mut stream, op, value)?;
                let (tag, sum) = read_frame(&mut stream)?;
                if Op::from_tag(tag) != Some(op) {
                    return Err(OrchestratorError::CollectiveMismatch {
                        rank: self.rank,
                        expected: Op::from_tag(tag).map_or("unknown", Op::name),
                        found: op.name(),
                    });
                }
                Ok(sum)
            }
        }
    }
}

impl Collective for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, value: i64) -> Result<i64> {
        self.exchange(Op::AllReduce, value)
    }

    fn barrier(&self) -> Result<()> {
        self.exchange(Op::Barrier, 0).map(|_| ())
    }
}
