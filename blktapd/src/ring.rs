//! Ring backend (spec §4.5 "Xen shared-ring backend (C6)" / §4.6 "I/O
//! context (C7)"), implemented against `vhost-user-backend`/`virtio-queue`/
//! `vm-memory` per the terminology mapping in SPEC_FULL.md §Terminology:
//! `VIRTIO_BLK_T_FLUSH` stands in for `BLKIF_OP_WRITE_BARRIER`, and because
//! `vhost-user-backend` already hands us guest memory directly, the
//! grant-copy ioctl of spec §6 degenerates to one `vm_memory::VolatileSlice`
//! per segment — still one explicit step per segment, preserving the
//! per-segment-status-check invariant even with no ioctl to fail.
//!
//! Grounded on `pevub/src/main.rs` (`VhostUserService`, `process_queue`,
//! `process_item`, `handle_event`'s event_idx dance) for the frontend
//! plumbing, generalised from "serve one fake read" to driving a full
//! [`crate::vbd::Vbd`] for read/write/flush.
//!
//! Completion here follows `pevub`'s own synchronous `process_item`: one
//! descriptor-chain batch is drained from the vring, every vreq in the
//! batch is queued, `Vbd::issue_requests` is called once, and every vreq
//! that completed synchronously (true for the one driver this crate ships,
//! `drivers::raw`, which blocks on its own I/O) is turned directly into a
//! used-ring entry. A vreq that does not complete before `issue_requests`
//! returns is not retried on the next kick (spec's async completion path
//! through a background disk-I/O completion fd is future work, see
//! DESIGN.md) — this crate's one driver never leaves that gap open.

use std::cell::RefCell;
use std::ops::Deref;
use std::rc::Rc;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use log::{error, trace, warn};
use smallvec::{smallvec, SmallVec};
use vhost::vhost_user::message::{VHOST_USER_CONFIG_OFFSET, VhostUserProtocolFeatures, VhostUserVirtioFeatures};
use vhost_user_backend::{VhostUserBackendMut, VringRwLock, VringState, VringT};
use virtio_bindings::virtio_blk::{
    virtio_blk_config as VirtioBlockConfig, virtio_blk_outhdr as VirtioBlockHeader, VIRTIO_BLK_S_IOERR,
    VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP, VIRTIO_BLK_T_FLUSH, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT,
};
use virtio_queue::desc::split::Descriptor;
use virtio_queue::{DescriptorChain, QueueT};
use vm_memory::{ByteValued, Bytes, GuestAddress, GuestAddressSpace, GuestMemoryAtomic, GuestMemoryMmap};
use vmm_sys_util::epoll::EventSet;
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::driver::{Iov, Op};
use crate::error::BlkError;
use crate::vbd::Vbd;

pub const QUEUE_SIZE: usize = 1024;
/// Maximum data-bearing segments accepted per request (spec §4.5
/// `MAX_SEGMENTS`); caps the `SmallVec` inline capacity too.
pub const MAX_SEGMENTS: usize = 16;

/// Spec §5 "Memory modes": queried at each ring-event entry. In `Low`, a
/// pass admits at most one new descriptor if a request is already in
/// flight on the VBD, and none at all otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryMode {
    #[default]
    Normal,
    Low,
}

#[derive(Copy, Clone)]
struct VirtioBlockConfigWriter(VirtioBlockConfig);
unsafe impl ByteValued for VirtioBlockConfigWriter {}

#[derive(Copy, Clone)]
struct VirtioBlockHeaderReader(VirtioBlockHeader);
unsafe impl ByteValued for VirtioBlockHeaderReader {}

#[derive(Debug, thiserror::Error)]
enum RingError {
    #[error("no head descriptor")]
    NoHead,
    #[error("head descriptor must be readable")]
    NeedRead,
    #[error("data descriptor must match request direction")]
    NeedWrite,
    #[error("no status descriptor")]
    NoStatus,
    #[error("status descriptor too small")]
    StatusDescTooSmall,
    #[error("guest memory access failed")]
    Mem,
}

impl From<RingError> for std::io::Error {
    fn from(e: RingError) -> Self {
        std::io::Error::other(e)
    }
}

fn read_header(mem: &GuestMemoryMmap<()>, addr: GuestAddress) -> Result<VirtioBlockHeader, RingError> {
    Ok(mem.read_obj::<VirtioBlockHeaderReader>(addr).map_err(|_| RingError::Mem)?.0)
}

struct Response {
    status: u8,
    status_addr: GuestAddress,
    len: u32,
}

impl Response {
    fn ioerr(status_addr: GuestAddress) -> Self {
        Response { status: VIRTIO_BLK_S_IOERR as u8, len: 1, status_addr }
    }
}

/// One descriptor-chain's worth of work still outstanding inside
/// `Vbd::issue_requests` when a response is produced.
struct Outcome {
    head_index: u16,
    result: Rc<RefCell<Option<Result<(), BlkError>>>>,
    status_addr: GuestAddress,
    len: u32,
}

/// What came out of parsing one descriptor chain: either it was handed to
/// the VBD and is still in flight, or it was answered on the spot (a
/// flush, or an opcode we don't serve) without ever reaching `Vbd`.
enum ParseOutcome {
    Queued(Outcome),
    Immediate { status: u8, status_addr: GuestAddress, len: u32 },
}

/// The vhost-user block backend (spec §4.5/§4.6). One instance serves one
/// VBD over one pool of virtqueues.
pub struct RingBackend {
    mem: GuestMemoryAtomic<GuestMemoryMmap>,
    config: VirtioBlockConfig,
    exit_evt: EventFd,
    vbd: Vbd,
    memory_mode: MemoryMode,
    #[cfg(feature = "event_idx")]
    event_idx: bool,
}

impl RingBackend {
    pub fn new(mem: GuestMemoryAtomic<GuestMemoryMmap>, vbd: Vbd) -> std::io::Result<Self> {
        let info = vbd.disk_info();
        let (capacity, block_size) = info.map(|i| (i.size_sectors, i.sector_size)).unwrap_or((0, 512));

        Ok(RingBackend {
            mem,
            config: VirtioBlockConfig {
                capacity,
                blk_size: block_size,
                size_max: 65536,
                seg_max: MAX_SEGMENTS as u32,
                num_queues: 1,
                alignment_offset: 0,
                physical_block_exp: 0,
                min_io_size: 1,
                opt_io_size: 1,
                ..Default::default()
            },
            exit_evt: EventFd::new(EFD_NONBLOCK)?,
            vbd,
            memory_mode: MemoryMode::default(),
            #[cfg(feature = "event_idx")]
            event_idx: false,
        })
    }

    pub fn set_memory_mode(&mut self, mode: MemoryMode) {
        self.memory_mode = mode;
    }

    fn process_queue(&mut self, vring: &mut RwLockWriteGuard<'_, VringState>) -> Result<bool, RingError> {
        let mut outcomes = Vec::new();
        let mut immediate: Vec<(u16, Response)> = Vec::new();

        // Spec §5 "Memory modes": the mode is queried fresh at each
        // ring-event entry, so a mode change takes effect on the very next
        // pass rather than waiting for the current one to drain.
        let admit_limit = match self.memory_mode {
            MemoryMode::Normal => usize::MAX,
            MemoryMode::Low if self.vbd.requests_in_flight() > 0 => 1,
            MemoryMode::Low => 0,
        };
        let mut admitted = 0usize;

        while admitted < admit_limit {
            let Some(mut chain) = vring.get_queue_mut().pop_descriptor_chain(self.mem.memory()) else {
                break;
            };
            admitted += 1;
            let head_index = chain.head_index();
            match self.parse_and_queue(&mut chain) {
                Ok(ParseOutcome::Queued(outcome)) => outcomes.push(outcome),
                Ok(ParseOutcome::Immediate { status, status_addr, len }) => {
                    immediate.push((head_index, Response { status, status_addr, len }));
                }
                Err(e) => {
                    error!("ring: error parsing request: {e}");
                    // No status descriptor to address reliably; still retire
                    // the chain with len=1, matching the teacher's own
                    // error path in `process_queue`.
                    vring.add_used(head_index, 1).map_err(|_| RingError::Mem)?;
                }
            }
        }

        self.vbd.issue_requests();

        let mut used_any = !immediate.is_empty();
        for (head_index, resp) in immediate {
            if self.mem.memory().write_obj(resp.status, resp.status_addr).is_err() {
                error!("ring: failed to write status byte");
            }
            vring.add_used(head_index, resp.len).map_err(|_| RingError::Mem)?;
        }

        for outcome in outcomes {
            let result = outcome.result.borrow_mut().take();
            let resp = match result {
                Some(Ok(())) => Response { status: VIRTIO_BLK_S_OK as u8, status_addr: outcome.status_addr, len: outcome.len },
                Some(Err(_)) => Response::ioerr(outcome.status_addr),
                None => {
                    warn!("ring: vreq did not complete synchronously, failing request");
                    Response::ioerr(outcome.status_addr)
                }
            };
            if self.mem.memory().write_obj(resp.status, resp.status_addr).is_err() {
                error!("ring: failed to write status byte");
            }
            vring.add_used(outcome.head_index, resp.len).map_err(|_| RingError::Mem)?;
            used_any = true;
        }
        Ok(used_any)
    }

    /// Parses one descriptor chain into a vreq and queues it on the VBD.
    fn parse_and_queue<M>(&mut self, chain: &mut DescriptorChain<M>) -> Result<ParseOutcome, RingError>
    where
        M: Deref<Target = GuestMemoryMmap<()>>,
    {
        let head_index = chain.head_index();
        let head_desc = chain.next().ok_or(RingError::NoHead)?;
        if head_desc.is_write_only() {
            return Err(RingError::NeedRead);
        }
        let header = read_header(chain.memory(), head_desc.addr())?;

        let mut descs: SmallVec<[Descriptor; MAX_SEGMENTS]> = smallvec![];
        let mut status_desc = None;
        while let Some(desc) = chain.next() {
            if desc.has_next() {
                descs.push(desc);
            } else {
                status_desc = Some(desc);
            }
        }
        let status_desc = status_desc.ok_or(RingError::NoStatus)?;
        if status_desc.len() < 1 {
            return Err(RingError::StatusDescTooSmall);
        }

        let op = match header.type_ {
            VIRTIO_BLK_T_IN => Op::Read,
            VIRTIO_BLK_T_OUT => Op::Write,
            VIRTIO_BLK_T_FLUSH => {
                // Barrier semantics (spec §4.5): complete strictly after all
                // earlier ring requests. Since `process_queue` drains and
                // waits on one batch at a time, a flush at the end of a
                // batch already satisfies that without extra bookkeeping.
                trace!("ring: flush on head {head_index}");
                return Ok(ParseOutcome::Immediate { status: VIRTIO_BLK_S_OK as u8, status_addr: status_desc.addr(), len: 0 });
            }
            _ => {
                warn!("ring: unsupported request type {} on head {head_index}", header.type_);
                return Ok(ParseOutcome::Immediate { status: VIRTIO_BLK_S_UNSUPP as u8, status_addr: status_desc.addr(), len: 1 });
            }
        };

        for desc in &descs {
            let writable = desc.is_write_only();
            if (op == Op::Read && !writable) || (op == Op::Write && writable) {
                return Err(RingError::NeedWrite);
            }
        }

        let mut iov = Vec::with_capacity(descs.len());
        let mut total_len = 0u32;
        for desc in &descs {
            let len = desc.len();
            if len % crate::driver::SECTOR_SIZE != 0 {
                return Err(RingError::Mem);
            }
            let slice = chain.memory().get_slice(desc.addr(), len as usize).map_err(|_| RingError::Mem)?;
            let base = slice.ptr_guard_mut().as_ptr();
            iov.push(Iov { base, secs: len / crate::driver::SECTOR_SIZE });
            total_len += len;
        }

        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        self.vbd.queue_request(op, header.sector, iov, head_index as u64, Box::new(move |res, _token| {
            *result2.borrow_mut() = Some(res);
        }));

        Ok(ParseOutcome::Queued(Outcome { head_index, result, status_addr: status_desc.addr(), len: total_len }))
    }
}

impl VhostUserBackendMut for RingBackend {
    type Bitmap = ();
    type Vring = VringRwLock;

    fn num_queues(&self) -> usize {
        1
    }

    fn max_queue_size(&self) -> usize {
        QUEUE_SIZE
    }

    fn features(&self) -> u64 {
        use virtio_bindings::virtio_blk::*;
        use virtio_bindings::virtio_config::*;

        #[cfg(feature = "event_idx")]
        let enable_event_idx = 1 << virtio_bindings::virtio_ring::VIRTIO_RING_F_EVENT_IDX;
        #[cfg(not(feature = "event_idx"))]
        let enable_event_idx = 0;

        (1 << VIRTIO_BLK_F_SEG_MAX)
            | (1 << VIRTIO_BLK_F_SIZE_MAX)
            | (1 << VIRTIO_BLK_F_BLK_SIZE)
            | (1 << VIRTIO_BLK_F_TOPOLOGY)
            | (1 << VIRTIO_BLK_F_FLUSH)
            | (1 << VIRTIO_BLK_F_RO)
            | (1 << VIRTIO_F_VERSION_1)
            | enable_event_idx
            | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits()
    }

    fn protocol_features(&self) -> VhostUserProtocolFeatures {
        VhostUserProtocolFeatures::CONFIG
    }

    fn update_memory(&mut self, _mem: GuestMemoryAtomic<GuestMemoryMmap>) -> std::io::Result<()> {
        Ok(())
    }

    #[cfg(feature = "event_idx")]
    fn set_event_idx(&mut self, event_idx: bool) {
        self.event_idx = event_idx;
    }

    #[cfg(not(feature = "event_idx"))]
    fn set_event_idx(&mut self, event_idx: bool) {
        if event_idx {
            error!("event_idx unsupported");
        }
    }

    fn handle_event(
        &mut self,
        device_event: u16,
        evset: EventSet,
        vrings: &[VringRwLock<GuestMemoryAtomic<GuestMemoryMmap>>],
        _thread_id: usize,
    ) -> std::io::Result<()> {
        if evset != EventSet::IN {
            warn!("ring: handle_event called for non-IN event");
            return Ok(());
        }
        let mut vring = vrings[device_event as usize].get_mut();

        #[cfg(feature = "event_idx")]
        let event_idx = self.event_idx;
        #[cfg(not(feature = "event_idx"))]
        let event_idx = false;

        if event_idx {
            loop {
                vring.get_queue_mut().enable_notification(self.mem.memory().deref()).unwrap();
                if self.process_queue(&mut vring).unwrap_or(false) {
                    if vring.needs_notification().unwrap_or(true) {
                        vring.signal_used_queue().unwrap();
                    }
                } else {
                    break;
                }
            }
        } else if self.process_queue(&mut vring).unwrap_or(false) && vring.needs_notification().unwrap_or(true) {
            vring.signal_used_queue().unwrap();
        }

        Ok(())
    }

    fn get_config(&self, offset: u32, size: u32) -> Vec<u8> {
        if offset != VHOST_USER_CONFIG_OFFSET {
            return vec![];
        }
        VirtioBlockConfigWriter(self.config).as_slice().get(..size as usize).unwrap_or(&[]).to_vec()
    }

    fn set_config(&mut self, _offset: u32, _buf: &[u8]) -> std::io::Result<()> {
        warn!("ring: set_config called, ignoring");
        Ok(())
    }

    fn queues_per_thread(&self) -> Vec<u64> {
        vec![1]
    }

    fn exit_event(&self, _thread_index: usize) -> Option<EventFd> {
        self.exit_evt.try_clone().ok()
    }
}

/// Wraps a [`RingBackend`] the way `vhost-user-backend` requires: shared,
/// lock-protected, ref-counted. Spec §4.6's "ref-counted context pool" (C7)
/// collapses to this one `Arc<RwLock<_>>` per VBD since each pool here
/// serves exactly one device (no multi-VBD context sharing is implemented;
/// see DESIGN.md).
pub type SharedRingBackend = Arc<RwLock<RingBackend>>;

pub fn shared(backend: RingBackend) -> SharedRingBackend {
    Arc::new(RwLock::new(backend))
}
