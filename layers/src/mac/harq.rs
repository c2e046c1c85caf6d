//! HARQ Process Pool
//!
//! Fixed-capacity set of HARQ process ids partitioned into three ordered
//! queues. All queues share one pair of link arrays indexed by process id, so
//! moving an id between queues is O(1) and never allocates.

use super::MacError;
use common::types::SlotPoint;
use thiserror::Error;

/// HARQ process identifier
pub type HarqId = u8;

/// Largest HARQ process count a UE may negotiate
pub const MAX_HARQ_PROCESSES: usize = 32;

/// Default number of transmissions (initial + retransmissions) per TB
pub const DEFAULT_MAX_ROUNDS: u8 = 4;

const NIL: u8 = u8::MAX;

/// No process id is left in the available queue
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("HARQ processes exhausted")]
pub struct Exhausted;

/// The queue a process currently belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqQueue {
    /// Free for a new transport block
    Available,
    /// Transmitted (or being transmitted), waiting for ACK/NACK
    AwaitingFeedback,
    /// NACKed, waiting for a retransmission opportunity
    AwaitingRetransmission,
}

impl HarqQueue {
    fn index(self) -> usize {
        match self {
            HarqQueue::Available => 0,
            HarqQueue::AwaitingFeedback => 1,
            HarqQueue::AwaitingRetransmission => 2,
        }
    }
}

/// Result of applying feedback to a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackOutcome {
    /// ACK: the process is available again
    Released,
    /// NACK: queued for retransmission round `round`
    Retransmit { round: u8 },
    /// NACK on the last allowed round: the TB is dropped
    Discarded,
}

/// Transmission record of one HARQ process
#[derive(Debug, Clone, Default)]
pub struct HarqProcess {
    /// Current round, 0 for the initial transmission
    pub round: u8,
    /// New data indicator, toggled for every new TB
    pub ndi: bool,
    /// Transport block size in bytes
    pub tb_bytes: u32,
    /// MCS used for the initial transmission
    pub mcs: u8,
    /// Number of RBs of the allocation
    pub num_rbs: u16,
    /// Slot at which feedback is expected, unset until the grant is committed
    pub feedback_due: Option<SlotPoint>,
}

#[derive(Debug, Clone, Copy)]
struct QueueEnds {
    head: u8,
    tail: u8,
    len: u8,
}

impl QueueEnds {
    const EMPTY: Self = Self { head: NIL, tail: NIL, len: 0 };
}

/// HARQ process pool of one UE in one direction
#[derive(Debug, Clone)]
pub struct HarqProcessPool {
    next: Vec<u8>,
    prev: Vec<u8>,
    location: Vec<HarqQueue>,
    queues: [QueueEnds; 3],
    processes: Vec<HarqProcess>,
    max_rounds: u8,
}

impl HarqProcessPool {
    /// Create a pool with all `capacity` ids in the available queue
    pub fn new(capacity: usize, max_rounds: u8) -> Result<Self, MacError> {
        if capacity == 0 || capacity > MAX_HARQ_PROCESSES {
            return Err(MacError::InvalidConfiguration(format!(
                "HARQ process count {} outside 1..={}",
                capacity, MAX_HARQ_PROCESSES
            )));
        }
        if max_rounds == 0 {
            return Err(MacError::InvalidConfiguration("HARQ max rounds must be at least 1".into()));
        }

        let mut pool = Self {
            next: Vec::with_capacity(MAX_HARQ_PROCESSES),
            prev: Vec::with_capacity(MAX_HARQ_PROCESSES),
            location: Vec::with_capacity(MAX_HARQ_PROCESSES),
            queues: [QueueEnds::EMPTY; 3],
            processes: Vec::with_capacity(MAX_HARQ_PROCESSES),
            max_rounds,
        };
        pool.grow_to(capacity);
        Ok(pool)
    }

    /// Total number of process ids
    pub fn capacity(&self) -> usize {
        self.processes.len()
    }

    /// Number of ids in `queue`
    pub fn len(&self, queue: HarqQueue) -> usize {
        self.queues[queue.index()].len as usize
    }

    /// Queue holding `id`, `None` for ids outside the pool
    pub fn queue_of(&self, id: HarqId) -> Option<HarqQueue> {
        self.location.get(id as usize).copied()
    }

    /// Transmission record of `id`
    pub fn process(&self, id: HarqId) -> Option<&HarqProcess> {
        self.processes.get(id as usize)
    }

    /// Ids of `queue` in order, head first
    pub fn iter(&self, queue: HarqQueue) -> impl Iterator<Item = HarqId> + '_ {
        let mut cursor = self.queues[queue.index()].head;
        std::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let id = cursor;
            cursor = self.next[id as usize];
            Some(id)
        })
    }

    /// Take the head of the available queue for a new transport block.
    ///
    /// The id is parked in the feedback queue with no due slot until
    /// [`mark_awaiting_feedback`](Self::mark_awaiting_feedback) commits it or
    /// [`abort`](Self::abort) gives it back.
    pub fn take_available(&mut self) -> Result<HarqId, Exhausted> {
        let id = self.pop_front(HarqQueue::Available).ok_or(Exhausted)?;
        self.push_back(HarqQueue::AwaitingFeedback, id);

        let process = &mut self.processes[id as usize];
        process.round = 0;
        process.ndi = !process.ndi;
        process.feedback_due = None;
        Ok(id)
    }

    /// Take the head of the retransmission queue, bumping its round
    pub fn take_retransmission(&mut self) -> Option<HarqId> {
        let id = self.pop_front(HarqQueue::AwaitingRetransmission)?;
        self.push_back(HarqQueue::AwaitingFeedback, id);

        let process = &mut self.processes[id as usize];
        process.round += 1;
        process.feedback_due = None;
        Some(id)
    }

    /// Commit `id` as transmitted with feedback expected at `due`.
    ///
    /// Accepts an id still in the available queue (moved directly) or one
    /// previously taken and not yet committed.
    pub fn mark_awaiting_feedback(&mut self, id: HarqId, due: SlotPoint) -> Result<(), MacError> {
        match self.queue_of(id) {
            Some(HarqQueue::Available) => {
                self.unlink(id);
                self.push_back(HarqQueue::AwaitingFeedback, id);
                let process = &mut self.processes[id as usize];
                process.round = 0;
                process.ndi = !process.ndi;
            }
            Some(HarqQueue::AwaitingFeedback) if self.processes[id as usize].feedback_due.is_none() => {}
            Some(actual) => {
                return Err(MacError::UnexpectedHarqState {
                    id,
                    expected: HarqQueue::Available,
                    actual,
                })
            }
            None => return Err(MacError::HarqProcessOutOfRange { id, capacity: self.capacity() }),
        }
        self.processes[id as usize].feedback_due = Some(due);
        Ok(())
    }

    /// Store the allocation parameters of the TB carried by `id`
    pub fn record_transmission(&mut self, id: HarqId, tb_bytes: u32, mcs: u8, num_rbs: u16) {
        if let Some(process) = self.processes.get_mut(id as usize) {
            process.tb_bytes = tb_bytes;
            process.mcs = mcs;
            process.num_rbs = num_rbs;
        }
    }

    /// Give back an id taken this slot whose grant could not be completed.
    ///
    /// The id returns to the head of the queue it was taken from.
    pub fn abort(&mut self, id: HarqId) -> Result<(), MacError> {
        let committed = self.processes.get(id as usize).map(|p| p.feedback_due.is_some());
        match (self.queue_of(id), committed) {
            (Some(HarqQueue::AwaitingFeedback), Some(false)) => {}
            (Some(actual), _) => {
                return Err(MacError::UnexpectedHarqState {
                    id,
                    expected: HarqQueue::AwaitingFeedback,
                    actual,
                })
            }
            (None, _) => return Err(MacError::HarqProcessOutOfRange { id, capacity: self.capacity() }),
        }

        self.unlink(id);
        let process = &mut self.processes[id as usize];
        if process.round == 0 {
            process.ndi = !process.ndi;
            self.push_front(HarqQueue::Available, id);
        } else {
            process.round -= 1;
            self.push_front(HarqQueue::AwaitingRetransmission, id);
        }
        Ok(())
    }

    /// Apply ACK/NACK (or a feedback timeout as NACK) to `id`
    pub fn on_feedback(&mut self, id: HarqId, ack: bool) -> Result<FeedbackOutcome, MacError> {
        match self.queue_of(id) {
            Some(HarqQueue::AwaitingFeedback) => {}
            Some(actual) => {
                return Err(MacError::UnexpectedHarqState {
                    id,
                    expected: HarqQueue::AwaitingFeedback,
                    actual,
                })
            }
            None => return Err(MacError::HarqProcessOutOfRange { id, capacity: self.capacity() }),
        }

        self.unlink(id);
        let max_rounds = self.max_rounds;
        let process = &mut self.processes[id as usize];
        process.feedback_due = None;

        let outcome = if ack {
            FeedbackOutcome::Released
        } else if process.round + 1 >= max_rounds {
            FeedbackOutcome::Discarded
        } else {
            FeedbackOutcome::Retransmit { round: process.round + 1 }
        };

        match outcome {
            FeedbackOutcome::Retransmit { .. } => self.push_back(HarqQueue::AwaitingRetransmission, id),
            FeedbackOutcome::Released | FeedbackOutcome::Discarded => {
                process.round = 0;
                self.push_back(HarqQueue::Available, id);
            }
        }
        Ok(outcome)
    }

    /// Whether [`resize`](Self::resize) to `new_capacity` would succeed
    pub fn check_resize(&self, new_capacity: usize) -> Result<(), MacError> {
        let current = self.capacity();
        if new_capacity < current {
            return Err(MacError::InvalidHarqResize { current, requested: new_capacity });
        }
        if new_capacity > MAX_HARQ_PROCESSES {
            return Err(MacError::InvalidConfiguration(format!(
                "HARQ process count {} above {}",
                new_capacity, MAX_HARQ_PROCESSES
            )));
        }
        Ok(())
    }

    /// Grow the pool. Shrinking would leave in-flight ids dangling and is rejected.
    pub fn resize(&mut self, new_capacity: usize) -> Result<(), MacError> {
        self.check_resize(new_capacity)?;
        let current = self.capacity();
        if new_capacity > current {
            self.grow_to(new_capacity);
        }
        Ok(())
    }

    /// Committed ids whose feedback is later than `now`
    pub fn overdue(&self, now: SlotPoint, slots_per_frame: u16) -> impl Iterator<Item = HarqId> + '_ {
        let half_period = common::types::NUM_FRAMES as u32 * slots_per_frame as u32 / 2;
        self.iter(HarqQueue::AwaitingFeedback).filter(move |&id| {
            match self.processes[id as usize].feedback_due {
                Some(due) => {
                    let late = now.slots_since(due, slots_per_frame);
                    late > 0 && late < half_period
                }
                None => false,
            }
        })
    }

    fn grow_to(&mut self, capacity: usize) {
        for id in self.capacity()..capacity {
            self.next.push(NIL);
            self.prev.push(NIL);
            self.location.push(HarqQueue::Available);
            self.processes.push(HarqProcess::default());
            self.push_back(HarqQueue::Available, id as HarqId);
        }
    }

    fn push_back(&mut self, queue: HarqQueue, id: HarqId) {
        let ends = &mut self.queues[queue.index()];
        self.prev[id as usize] = ends.tail;
        self.next[id as usize] = NIL;
        if ends.tail == NIL {
            ends.head = id;
        } else {
            self.next[ends.tail as usize] = id;
        }
        ends.tail = id;
        ends.len += 1;
        self.location[id as usize] = queue;
    }

    fn push_front(&mut self, queue: HarqQueue, id: HarqId) {
        let ends = &mut self.queues[queue.index()];
        self.next[id as usize] = ends.head;
        self.prev[id as usize] = NIL;
        if ends.head == NIL {
            ends.tail = id;
        } else {
            self.prev[ends.head as usize] = id;
        }
        ends.head = id;
        ends.len += 1;
        self.location[id as usize] = queue;
    }

    fn pop_front(&mut self, queue: HarqQueue) -> Option<HarqId> {
        let head = self.queues[queue.index()].head;
        if head == NIL {
            return None;
        }
        self.unlink(head);
        Some(head)
    }

    // Detach `id` from its queue; the caller relinks it immediately
    fn unlink(&mut self, id: HarqId) {
        let queue = self.location[id as usize];
        let (prev, next) = (self.prev[id as usize], self.next[id as usize]);
        let ends = &mut self.queues[queue.index()];

        if prev == NIL {
            ends.head = next;
        } else {
            self.next[prev as usize] = next;
        }
        if next == NIL {
            ends.tail = prev;
        } else {
            self.prev[next as usize] = prev;
        }
        ends.len -= 1;
        self.next[id as usize] = NIL;
        self.prev[id as usize] = NIL;
    }
}
