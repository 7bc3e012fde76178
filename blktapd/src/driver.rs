//! The driver interface (spec §4.2, C3): a polymorphic image layer.
//!
//! Grounded on `original_source/drivers/tapdisk-driver.{c,h}`. The C side is
//! a vtable (`struct tap_disk`) stored per `td_driver_handle`; per the
//! spec's DESIGN NOTES this becomes a plain trait object (`Box<dyn
//! Driver>`). `type_tag` survives only as the small tag used to (de)serialise
//! an `x-chain:` descriptor (spec §4.3).

use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::error::BlkError;

pub const SECTOR_SIZE: u32 = 512;
pub type Sector = u64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverFlags: u32 {
        const RDONLY       = 0x0001;
        const SHAREABLE    = 0x0002;
        const STRICT       = 0x0004;
        const ADD_CACHE    = 0x0008;
        const LOG_DIRTY    = 0x0010;
        const LOCAL_CACHE  = 0x0020;
        const REUSE_PARENT = 0x0040;
        const STANDBY      = 0x0080;
        const SECONDARY    = 0x0100;
        const VHD_INDEX    = 0x0200;
    }
}

/// The small integer identifying a driver variant, preserved only for the
/// `x-chain:` descriptor grammar (spec §4.3, §9 DESIGN NOTES).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    RawAio,
    RawSync,
    Vhd,
    VhdSync,
    Ram,
    Qcow,
    BlockCache,
    VhdIndex,
    Log,
    LocalCache,
    Valve,
    Nbd,
    Ntnx,
    Export,
}

impl TypeTag {
    /// Filter drivers (spec §4.2) hold no physical data of their own; their
    /// `disk_info` is inherited from their parent at chain-validation time.
    pub fn is_filter(self) -> bool {
        matches!(
            self,
            TypeTag::BlockCache | TypeTag::Log | TypeTag::LocalCache | TypeTag::Valve | TypeTag::VhdIndex
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TypeTag::RawAio => "aio",
            TypeTag::RawSync => "sync",
            TypeTag::Vhd => "vhd",
            TypeTag::VhdSync => "vhdsync",
            TypeTag::Ram => "ram",
            TypeTag::Qcow => "qcow",
            TypeTag::BlockCache => "block-cache",
            TypeTag::VhdIndex => "vhd-index",
            TypeTag::Log => "log",
            TypeTag::LocalCache => "local-cache",
            TypeTag::Valve => "valve",
            TypeTag::Nbd => "nbd",
            TypeTag::Ntnx => "ntnx",
            TypeTag::Export => "export",
        }
    }

    pub fn parse(s: &str) -> Result<Self, BlkError> {
        Ok(match s {
            "aio" => TypeTag::RawAio,
            "sync" => TypeTag::RawSync,
            "vhd" => TypeTag::Vhd,
            "vhdsync" => TypeTag::VhdSync,
            "ram" => TypeTag::Ram,
            "qcow" => TypeTag::Qcow,
            "block-cache" => TypeTag::BlockCache,
            "vhd-index" => TypeTag::VhdIndex,
            "log" => TypeTag::Log,
            "local-cache" => TypeTag::LocalCache,
            "valve" => TypeTag::Valve,
            "nbd" => TypeTag::Nbd,
            "ntnx" => TypeTag::Ntnx,
            "export" => TypeTag::Export,
            _ => return Err(BlkError::Invalid),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfo {
    pub size_sectors: u64,
    pub sector_size: u32,
    pub info_flags: u32,
}

impl DiskInfo {
    /// Range-checks a prospective transfer against this disk's bounds
    /// (spec §4.2 failure model: malformed range -> `-EINVAL`, never a panic).
    pub fn validate_range(&self, sec: Sector, secs: u32) -> Result<(), BlkError> {
        if secs == 0 {
            return Err(BlkError::Invalid);
        }
        let end = sec.checked_add(secs as u64).ok_or(BlkError::Invalid)?;
        if end > self.size_sectors {
            return Err(BlkError::Invalid);
        }
        Ok(())
    }
}

/// Identity a driver reports for its parent (spec §3 "Parent identity").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentId {
    pub name: String,
    pub type_tag: TypeTag,
    pub flags: DriverFlags,
}

/// One I/O vector element of a driver request. No partial sectors.
///
/// The spec's data model (§3) describes this as a raw `{base: *mut u8, secs:
/// u32}` pair, because segments may point into guest memory mapped outside
/// any Rust-tracked allocation (vhost-user guest memory, or a `mmap`ed
/// on-disk cache). `as_mut_slice` is the one place that turns it into a safe
/// slice for a driver implementation to fill or read.
#[derive(Clone, Copy)]
pub struct Iov {
    pub base: *mut u8,
    pub secs: u32,
}

unsafe impl Send for Iov {}

impl Iov {
    /// # Safety
    /// `base` must be valid and writable for `secs * SECTOR_SIZE` bytes for
    /// the duration the returned slice is used, and not aliased mutably
    /// elsewhere during that window.
    pub unsafe fn as_mut_slice(&self) -> &'static mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base, self.secs as usize * SECTOR_SIZE as usize) }
    }

    pub fn len_bytes(&self) -> usize {
        self.secs as usize * SECTOR_SIZE as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
    BlockStatus,
}

/// A per-segment driver request (treq, spec §3). Never outlives its vreq.
pub struct DriverRequest {
    pub op: Op,
    pub sec: Sector,
    pub secs: u32,
    pub buf: Iov,
    /// Index of this segment within the owning vreq's iov, for completion
    /// accounting back in the VBD layer.
    pub sidx: usize,
}

/// What a driver does with a treq it cannot answer itself: hand it to the
/// next image down the chain, or terminate it. Implemented by the VBD
/// engine's chain cursor (spec §4.2: `td_forward_request` / `td_complete_request`).
pub trait Forwarder {
    /// Passes the treq, unchanged, to the next image in the chain. If the
    /// chain bottoms out, sparse semantics apply: reads are zero-filled and
    /// completed with success, writes fail in code that constructs the cursor
    /// (a chain's root is never writable-unterminated).
    fn forward(&mut self, req: DriverRequest);
    /// Terminates the treq with the given result.
    fn complete(&mut self, req: DriverRequest, result: Result<(), BlkError>);
}

/// Runtime statistics a driver may optionally expose (spec §3 `hits_rd` etc,
/// lifted one level since they are the same shape for every driver).
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverStats {
    pub hits_rd: u64,
    pub hits_wr: u64,
    pub fail_rd: u64,
    pub fail_wr: u64,
}

/// The polymorphic driver interface (spec §4.2).
///
/// `queue_read`/`queue_write` must eventually call exactly one of
/// `fwd.forward(req)` or `fwd.complete(req, ..)`. They must not panic on
/// guest-supplied parameters: range-check against the `DiskInfo` returned by
/// `open` and return `Err(BlkError::Invalid)` instead.
pub trait Driver: Send {
    fn open(&mut self, name: &str, flags: DriverFlags) -> Result<DiskInfo, BlkError>;

    /// Releases resources. Must not return until all I/O submitted by this
    /// driver has been reaped.
    fn close(&mut self) -> Result<(), BlkError>;

    fn queue_read(&mut self, req: DriverRequest, fwd: &mut dyn Forwarder);
    fn queue_write(&mut self, req: DriverRequest, fwd: &mut dyn Forwarder);

    fn get_parent_id(&self) -> Result<Option<ParentId>, BlkError>;

    /// May veto the chain being built under this driver as parent.
    fn validate_parent(&self, parent: &ParentId, flags: DriverFlags) -> Result<(), BlkError>;

    fn stats(&self) -> Option<DriverStats> {
        None
    }

    fn debug(&self) {}
}

/// Token-bucket log limiter (spec §3 "loglimit"), ported from
/// `original_source/drivers/tapdisk-loglimit.c`: allow a burst, then drop
/// until the interval rolls over. Caps how many error lines one wedged
/// driver instance can emit.
pub struct LogLimit {
    burst: u32,
    interval: Duration,
    count: u32,
    dropped: u64,
    window_start: Instant,
}

impl LogLimit {
    pub fn new(burst: u32, interval: Duration) -> Self {
        LogLimit {
            burst,
            interval,
            count: 0,
            dropped: 0,
            window_start: Instant::now(),
        }
    }

    /// Returns `true` if this call may log, `false` if it should be dropped.
    pub fn pass(&mut self) -> bool {
        if self.interval.is_zero() {
            return true; // unlimited
        }
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.interval {
            self.count = 0;
            self.window_start = now;
        }
        if self.count >= self.burst {
            self.dropped += 1;
            return false;
        }
        self.count += 1;
        true
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_info_rejects_oob_and_zero_len() {
        let info = DiskInfo { size_sectors: 100, sector_size: 512, info_flags: 0 };
        assert!(info.validate_range(0, 100).is_ok());
        assert!(info.validate_range(99, 1).is_ok());
        assert_eq!(info.validate_range(99, 2).unwrap_err(), BlkError::Invalid);
        assert_eq!(info.validate_range(0, 0).unwrap_err(), BlkError::Invalid);
        assert_eq!(info.validate_range(u64::MAX, 1).unwrap_err(), BlkError::Invalid);
    }

    #[test]
    fn type_tag_roundtrips_through_x_chain_strings() {
        for t in [TypeTag::RawAio, TypeTag::Vhd, TypeTag::Nbd, TypeTag::BlockCache] {
            assert_eq!(TypeTag::parse(t.as_str()).unwrap(), t);
        }
        assert_eq!(TypeTag::parse("bogus").unwrap_err(), BlkError::Invalid);
    }

    #[test]
    fn loglimit_allows_burst_then_drops() {
        let mut ll = LogLimit::new(2, Duration::from_secs(3600));
        assert!(ll.pass());
        assert!(ll.pass());
        assert!(!ll.pass());
        assert_eq!(ll.dropped(), 1);
    }

    #[test]
    fn loglimit_zero_interval_is_unlimited() {
        let mut ll = LogLimit::new(0, Duration::ZERO);
        for _ in 0..1000 {
            assert!(ll.pass());
        }
    }
}
