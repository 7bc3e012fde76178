//! Image chain construction and validation (spec §4.3, C4).
//!
//! Grounded on `original_source/drivers/tapdisk-vbd.c`'s
//! `__tapdisk_vbd_open_vdi` (the parent-following loop) and
//! `tapdisk_vbd_validate_chain`. An `Image` is the positional chain slot
//! (spec §3); index 0 is the writable leaf, the last entry is the read-only
//! root.

use std::collections::HashMap;

use log::debug;

use crate::driver::{DiskInfo, Driver, DriverFlags, ParentId, TypeTag};
use crate::error::BlkError;

/// One opened layer in a VBD's chain.
pub struct Image {
    pub type_tag: TypeTag,
    pub name: String,
    pub flags: DriverFlags,
    pub driver: Box<dyn Driver>,
    pub disk_info: DiskInfo,
    /// Spec §3 "Driver instance" data model. Always 1 here: this crate opens
    /// one fresh driver instance per chain slot rather than sharing one
    /// instance across VBDs (see DESIGN.md) — the field is kept so the
    /// struct matches the spec's shape, not to back real cross-VBD sharing.
    pub refcnt: u32,
}

/// Constructs a fresh, unopened driver instance for a given type tag. Real
/// format codecs (VHD/QCOW/raw) are out of scope (spec §1); the core only
/// needs to be able to dispatch to whichever `Driver` impls are registered.
pub type DriverFactory = fn() -> Box<dyn Driver>;

#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<TypeTag, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: TypeTag, factory: DriverFactory) {
        self.factories.insert(tag, factory);
    }

    fn create(&self, tag: TypeTag) -> Result<Box<dyn Driver>, BlkError> {
        (self.factories.get(&tag).ok_or(BlkError::NotSupported)?)()
    }
}

/// Opens one layer and pushes it onto `chain`, rolling `chain` back and
/// returning the error on failure. Shared by `open_chain`'s implicit
/// parent-following and `open_chain_from_descriptor`'s explicit lines.
fn open_one(registry: &DriverRegistry, chain: &mut Vec<Image>, type_tag: TypeTag, name: String, flags: DriverFlags) -> Result<(), BlkError> {
    let mut driver = registry.create(type_tag)?;
    match driver.open(&name, flags) {
        Ok(disk_info) => {
            chain.push(Image { type_tag, name, flags, driver, disk_info, refcnt: 1 });
            Ok(())
        }
        Err(e) => {
            rollback(chain);
            Err(e)
        }
    }
}

/// Follows `chain`'s last image's own `get_parent_id` until `NO_PARENT`,
/// appending each discovered parent (opened read-only+shareable). Used both
/// to build a fully implicit chain and to extend an explicitly-described one
/// past its last named entry (spec §4.3).
fn follow_parents(registry: &DriverRegistry, chain: &mut Vec<Image>) -> Result<(), BlkError> {
    loop {
        let parent = match chain.last_mut().expect("chain non-empty").driver.get_parent_id() {
            Ok(p) => p,
            Err(BlkError::NoParent) => None,
            Err(e) => {
                rollback(chain);
                return Err(e);
            }
        };
        let Some(p) = parent else { break };
        let flags = p.flags | DriverFlags::RDONLY | DriverFlags::SHAREABLE;
        open_one(registry, chain, p.type_tag, p.name, flags)?;
    }
    Ok(())
}

/// Opens one image and, if it reports a parent, opens that too, and so on
/// until `get_parent_id` returns `Ok(None)` (spec's `NO_PARENT`). Every
/// parent is opened read-only and shareable. Mirrors
/// `__tapdisk_vbd_open_vdi`'s `for (;;)` loop.
///
/// If `parent_override` is given, it is appended as the immediate parent of
/// the leaf image instead of following that leaf's own reported parent (spec
/// §4.3 "live-migration primary capture" — used with a raw AIO driver on a
/// nominated block device).
pub fn open_chain(
    registry: &DriverRegistry,
    leaf_type: TypeTag,
    leaf_name: &str,
    leaf_flags: DriverFlags,
    parent_override: Option<(TypeTag, String)>,
) -> Result<Vec<Image>, BlkError> {
    let mut chain = Vec::new();
    open_one(registry, &mut chain, leaf_type, leaf_name.to_string(), leaf_flags)?;

    match parent_override {
        Some((ptag, pname)) => {
            let flags = DriverFlags::RDONLY | DriverFlags::SHAREABLE;
            open_one(registry, &mut chain, ptag, pname, flags)?;
            follow_parents(registry, &mut chain)?;
        }
        None => follow_parents(registry, &mut chain)?,
    }

    if let Err(e) = validate_chain(&mut chain) {
        rollback(&mut chain);
        return Err(e);
    }

    Ok(chain)
}

/// Opens a chain described explicitly by an `x-chain:` descriptor file
/// (spec §4.3): every line names one layer, leaf first. Once the listed
/// lines are exhausted, the last one's own `get_parent_id` is followed
/// exactly as `open_chain` follows an implicit chain, so any parent beyond
/// what the descriptor spells out is still discovered.
pub fn open_chain_from_descriptor(registry: &DriverRegistry, lines: &[ChainDescriptorLine]) -> Result<Vec<Image>, BlkError> {
    let mut chain = Vec::new();
    let Some((leaf, parents)) = lines.split_first() else {
        return Err(BlkError::Invalid);
    };

    let leaf_flags = flags_from_opts(DriverFlags::empty(), &leaf.opts);
    open_one(registry, &mut chain, leaf.type_tag, leaf.path.clone(), leaf_flags)?;

    for line in parents {
        let flags = flags_from_opts(DriverFlags::RDONLY | DriverFlags::SHAREABLE, &line.opts);
        open_one(registry, &mut chain, line.type_tag, line.path.clone(), flags)?;
    }

    follow_parents(registry, &mut chain)?;

    if let Err(e) = validate_chain(&mut chain) {
        rollback(&mut chain);
        return Err(e);
    }

    Ok(chain)
}

fn rollback(chain: &mut Vec<Image>) {
    for img in chain.drain(..) {
        let mut img = img;
        let _ = img.driver.close();
    }
}

/// Walks child -> parent, calling `validate_parent` on each adjacent pair,
/// and propagates `disk_info` down into filter drivers (spec §4.2, §4.3).
/// Mirrors `tapdisk_vbd_validate_chain`.
fn validate_chain(chain: &mut [Image]) -> Result<(), BlkError> {
    for i in 0..chain.len().saturating_sub(1) {
        let parent_id = ParentId {
            name: chain[i + 1].name.clone(),
            type_tag: chain[i + 1].type_tag,
            flags: chain[i + 1].flags,
        };
        chain[i].driver.validate_parent(&parent_id, chain[i].flags)?;

        if chain[i].type_tag.is_filter() {
            chain[i].disk_info = chain[i + 1].disk_info;
        }
        debug!("chain: {} ({:?}) -> {}", chain[i].name, chain[i].type_tag, chain[i + 1].name);
    }
    Ok(())
}

/// One parsed line of an `x-chain:/path/to/descriptor` file: `type:path
/// [opt1,opt2,...]`. Spec §9 Open Questions directs a line parser over the
/// documented grammar rather than the source's regex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDescriptorLine {
    pub type_tag: TypeTag,
    pub path: String,
    pub opts: Vec<String>,
}

/// Parses the `^<type>:<path>([ \t]+<opt1,opt2,...>)?$` grammar, one image
/// per line, blank lines and `#`-comments ignored.
pub fn parse_chain_descriptor(text: &str) -> Result<Vec<ChainDescriptorLine>, BlkError> {
    let mut lines = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (head, opts_part) = match line.split_once([' ', '\t']) {
            Some((h, rest)) => (h, Some(rest.trim())),
            None => (line, None),
        };

        let (type_str, path) = head.split_once(':').ok_or(BlkError::Invalid)?;
        if path.is_empty() {
            return Err(BlkError::Invalid);
        }
        let type_tag = TypeTag::parse(type_str)?;

        let opts = match opts_part {
            Some(s) if !s.is_empty() => s.split(',').map(|o| o.trim().to_string()).collect(),
            _ => Vec::new(),
        };

        lines.push(ChainDescriptorLine { type_tag, path: path.to_string(), opts });
    }
    Ok(lines)
}

/// Applies the options vocabulary recognised in chain descriptor lines
/// (`ro`, `shared`) on top of a base flag set.
pub fn flags_from_opts(base: DriverFlags, opts: &[String]) -> DriverFlags {
    let mut flags = base;
    for opt in opts {
        match opt.as_str() {
            "ro" => flags |= DriverFlags::RDONLY,
            "shared" => flags |= DriverFlags::SHAREABLE,
            "standby" => flags |= DriverFlags::STANDBY,
            _ => {}
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_descriptor() {
        let text = "aio:/dev/sdb\nvhd:/mnt/parent.vhd ro,shared\n";
        let lines = parse_chain_descriptor(text).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].type_tag, TypeTag::RawAio);
        assert_eq!(lines[0].path, "/dev/sdb");
        assert!(lines[0].opts.is_empty());
        assert_eq!(lines[1].type_tag, TypeTag::Vhd);
        assert_eq!(lines[1].opts, vec!["ro".to_string(), "shared".to_string()]);
    }

    #[test]
    fn ignores_blank_lines_and_comments() {
        let text = "\n# a comment\naio:/dev/sdb\n\n";
        let lines = parse_chain_descriptor(text).unwrap();
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn rejects_missing_colon() {
        assert_eq!(parse_chain_descriptor("aio-dev-sdb").unwrap_err(), BlkError::Invalid);
    }

    #[test]
    fn flags_from_opts_sets_bits() {
        let flags = flags_from_opts(DriverFlags::empty(), &["ro".to_string(), "shared".to_string()]);
        assert!(flags.contains(DriverFlags::RDONLY));
        assert!(flags.contains(DriverFlags::SHAREABLE));
    }

    use crate::driver::{DriverRequest, Forwarder};

    struct ChainLeafMock;
    impl Driver for ChainLeafMock {
        fn open(&mut self, name: &str, _flags: DriverFlags) -> Result<DiskInfo, BlkError> {
            assert_eq!(name, "leaf.img");
            Ok(DiskInfo { size_sectors: 100, sector_size: 512, info_flags: 0 })
        }
        fn close(&mut self) -> Result<(), BlkError> {
            Ok(())
        }
        fn queue_read(&mut self, _req: DriverRequest, _fwd: &mut dyn Forwarder) {
            unreachable!("chain construction does not issue I/O")
        }
        fn queue_write(&mut self, _req: DriverRequest, _fwd: &mut dyn Forwarder) {
            unreachable!("chain construction does not issue I/O")
        }
        fn get_parent_id(&self) -> Result<Option<ParentId>, BlkError> {
            // not named by the descriptor; open_chain_from_descriptor must
            // still follow it (spec §4.3's "extends past the last line").
            Ok(Some(ParentId { name: "implicit-parent.img".into(), type_tag: TypeTag::Vhd, flags: DriverFlags::empty() }))
        }
        fn validate_parent(&self, _parent: &ParentId, _flags: DriverFlags) -> Result<(), BlkError> {
            Ok(())
        }
    }

    struct ChainParentMock;
    impl Driver for ChainParentMock {
        fn open(&mut self, name: &str, _flags: DriverFlags) -> Result<DiskInfo, BlkError> {
            assert_eq!(name, "implicit-parent.img");
            Ok(DiskInfo { size_sectors: 100, sector_size: 512, info_flags: 0 })
        }
        fn close(&mut self) -> Result<(), BlkError> {
            Ok(())
        }
        fn queue_read(&mut self, _req: DriverRequest, _fwd: &mut dyn Forwarder) {
            unreachable!("chain construction does not issue I/O")
        }
        fn queue_write(&mut self, _req: DriverRequest, _fwd: &mut dyn Forwarder) {
            unreachable!("chain construction does not issue I/O")
        }
        fn get_parent_id(&self) -> Result<Option<ParentId>, BlkError> {
            Ok(None)
        }
        fn validate_parent(&self, _parent: &ParentId, _flags: DriverFlags) -> Result<(), BlkError> {
            Ok(())
        }
    }

    fn chain_leaf_factory() -> Box<dyn Driver> {
        Box::new(ChainLeafMock)
    }

    fn chain_parent_factory() -> Box<dyn Driver> {
        Box::new(ChainParentMock)
    }

    #[test]
    fn open_chain_from_descriptor_builds_explicit_lines_then_follows_parent() {
        let mut registry = DriverRegistry::new();
        registry.register(TypeTag::Ram, chain_leaf_factory);
        registry.register(TypeTag::Vhd, chain_parent_factory);

        let lines = parse_chain_descriptor("ram:leaf.img\n").unwrap();
        let chain = open_chain_from_descriptor(&registry, &lines).unwrap();

        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].name, "leaf.img");
        assert_eq!(chain[0].type_tag, TypeTag::Ram);
        assert!(!chain[0].flags.contains(DriverFlags::RDONLY));
        assert_eq!(chain[1].name, "implicit-parent.img");
        assert_eq!(chain[1].type_tag, TypeTag::Vhd);
        assert!(chain[1].flags.contains(DriverFlags::RDONLY));
        assert!(chain[1].flags.contains(DriverFlags::SHAREABLE));
    }

    #[test]
    fn open_chain_from_descriptor_rejects_empty_lines() {
        let registry = DriverRegistry::new();
        assert_eq!(open_chain_from_descriptor(&registry, &[]).unwrap_err(), BlkError::Invalid);
    }
}
