//! NBD wire format constants and small packing helpers (spec §4.8).
//!
//! Grounded on `original_source/drivers/tapdisk-nbdserver.c` and the
//! upstream NBD protocol document it implements against. Hand-rolled: no
//! crate in the pack models this wire format, so encoding/decoding is
//! explicit big-endian byte packing, matching the source's own
//! `htobe64`/`htonl`/`memcpy` style rather than reaching for `serde`.

/// Fixed 8-byte banner prefix for both old- and new-style negotiation.
pub const NBDMAGIC: u64 = 0x4e42444d41474943;
/// Old-style negotiation's second magic.
pub const CLISERV_MAGIC: u64 = 0x00420281861253;
/// New-style negotiation's second magic ("IHAVEOPT"), reused by the client
/// as the magic prefixing every option it sends.
pub const IHAVEOPT: u64 = 0x49484156454f5054;
/// Magic prefixing every fixed-newstyle option reply.
pub const NBD_REP_MAGIC: u64 = 0x0003e889045565a9;

pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;
pub const NBD_STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;

pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;
pub const NBD_OPT_STARTTLS: u32 = 5;
pub const NBD_OPT_INFO: u32 = 6;
pub const NBD_OPT_GO: u32 = 7;
pub const NBD_OPT_STRUCTURED_REPLY: u32 = 8;
pub const NBD_OPT_LIST_META_CONTEXT: u32 = 9;
pub const NBD_OPT_SET_META_CONTEXT: u32 = 10;

pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_META_CONTEXT: u32 = 4;
pub const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
pub const NBD_REP_ERR_UNSUP: u32 = NBD_REP_FLAG_ERROR | 1;
pub const NBD_REP_ERR_INVALID: u32 = NBD_REP_FLAG_ERROR | 3;

pub const NBD_INFO_EXPORT: u16 = 0;
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;

pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISC: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_BLOCK_STATUS: u16 = 7;

pub const NBD_REPLY_FLAG_DONE: u16 = 1 << 0;
pub const NBD_REPLY_TYPE_OFFSET_DATA: u16 = 1;
pub const NBD_REPLY_TYPE_BLOCK_STATUS: u16 = 5;
pub const NBD_REPLY_TYPE_ERROR: u16 = (1 << 15) + 1;

/// Per-client fixed request pool size (spec §4.8 `NBD_SERVER_NUM_REQS`).
pub const NUM_REQS: usize = 8;
pub const MAX_OPTIONS: u32 = 32;
pub const MAX_OPTION_LEN: u32 = 64 * 1024 * 1024;
pub const MAX_EXPORT_NAME_LEN: usize = 256;

/// One parsed `NBD_OPT_*` request header: `{magic, opt, len}`.
pub struct OptionHeader {
    pub opt: u32,
    pub len: u32,
}

/// One parsed transmission-phase request header (spec §4.8 "Request processing").
pub struct RequestHeader {
    pub ty: u16,
    pub handle: u64,
    pub from: u64,
    pub len: u32,
}

pub fn parse_request_header(buf: &[u8; 28]) -> Option<RequestHeader> {
    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != NBD_REQUEST_MAGIC {
        return None;
    }
    // buf[4..6] is the command-flags field (unused by this server); type follows.
    let ty = u16::from_be_bytes(buf[6..8].try_into().unwrap());
    let handle = u64::from_be_bytes(buf[8..16].try_into().unwrap());
    let from = u64::from_be_bytes(buf[16..24].try_into().unwrap());
    let len = u32::from_be_bytes(buf[24..28].try_into().unwrap());
    Some(RequestHeader { ty, handle, from, len })
}

pub fn simple_reply_header(handle: u64, error: u32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..4].copy_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
    buf[4..8].copy_from_slice(&error.to_be_bytes());
    buf[8..16].copy_from_slice(&handle.to_be_bytes());
    buf
}

pub fn structured_reply_header(handle: u64, flags: u16, ty: u16, len: u32) -> [u8; 20] {
    let mut buf = [0u8; 20];
    buf[0..4].copy_from_slice(&NBD_STRUCTURED_REPLY_MAGIC.to_be_bytes());
    buf[4..6].copy_from_slice(&flags.to_be_bytes());
    buf[6..8].copy_from_slice(&ty.to_be_bytes());
    buf[8..16].copy_from_slice(&handle.to_be_bytes());
    buf[16..20].copy_from_slice(&len.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_request_header() {
        let mut buf = [0u8; 28];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&0u16.to_be_bytes());
        buf[6..8].copy_from_slice(&NBD_CMD_WRITE.to_be_bytes());
        buf[8..16].copy_from_slice(&42u64.to_be_bytes());
        buf[16..24].copy_from_slice(&4096u64.to_be_bytes());
        buf[24..28].copy_from_slice(&512u32.to_be_bytes());

        let hdr = parse_request_header(&buf).unwrap();
        assert_eq!(hdr.ty, NBD_CMD_WRITE);
        assert_eq!(hdr.handle, 42);
        assert_eq!(hdr.from, 4096);
        assert_eq!(hdr.len, 512);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = [0u8; 28];
        assert!(parse_request_header(&buf).is_none());
    }

    #[test]
    fn simple_reply_header_encodes_be() {
        let buf = simple_reply_header(7, 0);
        assert_eq!(u32::from_be_bytes(buf[0..4].try_into().unwrap()), NBD_REPLY_MAGIC);
        assert_eq!(u64::from_be_bytes(buf[8..16].try_into().unwrap()), 7);
    }
}
