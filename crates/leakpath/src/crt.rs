//! Recognition of debug C runtime block headers.
//!
//! A debug CRT prepends a bookkeeping header to every user allocation and surrounds the
//! user region with "no man's land" guard bytes. When such a block leaks, the header tells
//! us the size the program actually asked for and whether the runtime owns the block.
//!
//! Two layouts exist. The legacy header stores `size` before `use` on 32-bit targets; the
//! universal CRT header always stores `use` first. Both end with a request number and four
//! guard bytes.

use crate::handle::Address;

/// Bytes of no man's land between the header and the user region.
pub const GAP_SIZE: usize = 4;
/// Value the runtime fills no man's land with.
pub const NO_MANS_LAND: u8 = 0xFD;

const PTR: usize = std::mem::size_of::<usize>();

/// Size of either header layout on the current target.
pub const HEADER_LEN: usize = 3 * PTR + 4 + 4 + PTR + 4 + GAP_SIZE;

/// Block use tags stored in the low 16 bits of the header's `use` field.
pub mod block_use {
    pub const FREE: i32 = 0;
    pub const NORMAL: i32 = 1;
    /// Blocks the runtime allocates for itself.
    pub const INTERNAL: i32 = 2;
    pub const IGNORE: i32 = 3;
    pub const CLIENT: i32 = 4;

    pub fn type_of(tag: i32) -> i32 {
        tag & 0xFFFF
    }

    pub fn is_valid(tag: i32) -> bool {
        type_of(tag) == CLIENT || tag == NORMAL || type_of(tag) == INTERNAL || tag == IGNORE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrtLayout {
    Legacy,
    Ucrt,
}

/// A validated debug CRT header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtHeader {
    pub layout: CrtLayout,
    pub file: usize,
    pub line: i32,
    pub block_use: i32,
    pub size: usize,
    pub request: i32,
}

impl CrtHeader {
    /// Decodes `bytes` as a header of the given layout without validating it.
    ///
    /// Used for blocks the allocation hook already declared as debug CRT blocks.
    pub fn decode(bytes: &[u8], layout: CrtLayout) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let mut cursor = Cursor { bytes, at: 0 };
        let _next = cursor.ptr();
        let _prev = cursor.ptr();
        let file = cursor.ptr();
        let line = cursor.int();
        let (block_use, size) = if layout == CrtLayout::Legacy && PTR == 4 {
            let size = cursor.ptr();
            (cursor.int(), size)
        } else {
            let block_use = cursor.int();
            (block_use, cursor.ptr())
        };
        let request = cursor.int();

        Some(Self {
            layout,
            file,
            line,
            block_use,
            size,
            request,
        })
    }

    /// Parses `bytes` as a header of the given layout for a raw block of `block_size` bytes.
    ///
    /// Returns `None` unless the use tag is valid, the header plus user region plus guard
    /// exactly fills the block, and the guard bytes hold the no man's land pattern.
    pub fn parse(bytes: &[u8], layout: CrtLayout, block_size: usize) -> Option<Self> {
        let header = Self::decode(bytes, layout)?;
        let gap = &bytes[HEADER_LEN - GAP_SIZE..HEADER_LEN];

        if !block_use::is_valid(header.block_use) {
            return None;
        }
        if HEADER_LEN.checked_add(header.size)?.checked_add(GAP_SIZE)? != block_size {
            return None;
        }
        if gap.iter().any(|&b| b != NO_MANS_LAND) {
            return None;
        }
        Some(header)
    }

    pub fn is_ucrt(&self) -> bool {
        self.layout == CrtLayout::Ucrt
    }

    /// Blocks the runtime frees on its own after the detector is gone.
    pub fn is_runtime_owned(&self) -> bool {
        matches!(
            block_use::type_of(self.block_use),
            block_use::FREE | block_use::INTERNAL
        )
    }

    /// Address of the user region inside the raw block at `block`.
    pub fn user_address(block: Address) -> Address {
        block.offset(HEADER_LEN)
    }
}

/// Tries the legacy layout, then the universal one.
pub fn sniff(bytes: &[u8], block_size: usize) -> Option<CrtHeader> {
    CrtHeader::parse(bytes, CrtLayout::Legacy, block_size)
        .or_else(|| CrtHeader::parse(bytes, CrtLayout::Ucrt, block_size))
}

/// Reads the header of a block through `inspector`.
///
/// With a known `layout` the header is trusted and only decoded; with `None` both layouts
/// are sniffed and validated.
pub fn read_header(
    inspector: &dyn MemoryInspector,
    block: Address,
    block_size: usize,
    layout: Option<CrtLayout>,
) -> Option<CrtHeader> {
    if block_size < HEADER_LEN + GAP_SIZE {
        return None;
    }
    let mut buf = [0u8; HEADER_LEN];
    if !inspector.read(block, &mut buf) {
        return None;
    }
    match layout {
        Some(layout) => CrtHeader::decode(&buf, layout),
        None => sniff(&buf, block_size),
    }
}

/// Read access to the memory behind tracked addresses.
pub trait MemoryInspector: Send + Sync {
    /// Fills `buf` with the bytes at `address`. Returns `false` if they cannot be read.
    fn read(&self, address: Address, buf: &mut [u8]) -> bool;
}

/// Reads live process memory.
///
/// Only addresses of blocks still present in the registry are ever passed in.
pub struct RawMemory;

impl MemoryInspector for RawMemory {
    fn read(&self, address: Address, buf: &mut [u8]) -> bool {
        if address.is_null() {
            return false;
        }
        // SAFETY: `address` is a block still in the registry, read under the registry lock.
        // Every free and every moving reallocation removes its block from the registry
        // before the memory goes back to the system, so the block is live and at least
        // `buf.len()` bytes long.
        unsafe {
            std::ptr::copy_nonoverlapping(address.0 as *const u8, buf.as_mut_ptr(), buf.len());
        }
        true
    }
}

/// Inspector that never reads; every block is treated as a plain allocation.
pub struct NoInspection;

impl MemoryInspector for NoInspection {
    fn read(&self, _address: Address, _buf: &mut [u8]) -> bool {
        false
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let slice = &self.bytes[self.at..self.at + n];
        self.at += n;
        slice
    }

    fn ptr(&mut self) -> usize {
        let mut raw = [0u8; PTR];
        raw.copy_from_slice(self.take(PTR));
        usize::from_ne_bytes(raw)
    }

    fn int(&mut self) -> i32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4));
        i32::from_ne_bytes(raw)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Builds the bytes of a debug CRT block holding `user_size` bytes of user data.
    pub(crate) fn debug_block(layout: CrtLayout, block_use: i32, user_size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0usize.to_ne_bytes());
        out.extend_from_slice(&0usize.to_ne_bytes());
        out.extend_from_slice(&0x1234usize.to_ne_bytes());
        out.extend_from_slice(&42i32.to_ne_bytes());
        if layout == CrtLayout::Legacy && PTR == 4 {
            out.extend_from_slice(&user_size.to_ne_bytes());
            out.extend_from_slice(&block_use.to_ne_bytes());
        } else {
            out.extend_from_slice(&block_use.to_ne_bytes());
            out.extend_from_slice(&user_size.to_ne_bytes());
        }
        out.extend_from_slice(&7i32.to_ne_bytes());
        out.extend_from_slice(&[NO_MANS_LAND; GAP_SIZE]);
        out.extend(std::iter::repeat(0xAB).take(user_size));
        out.extend_from_slice(&[NO_MANS_LAND; GAP_SIZE]);
        out
    }

    /// In-memory stand-in for process memory.
    #[derive(Default)]
    pub(crate) struct FakeMemory(pub Mutex<HashMap<usize, Vec<u8>>>);

    impl FakeMemory {
        pub(crate) fn insert(&self, address: usize, bytes: Vec<u8>) {
            self.0.lock().unwrap().insert(address, bytes);
        }
    }

    impl MemoryInspector for FakeMemory {
        fn read(&self, address: Address, buf: &mut [u8]) -> bool {
            let map = self.0.lock().unwrap();
            let region = map.iter().find_map(|(&start, bytes)| {
                let offset = address.0.checked_sub(start)?;
                bytes.get(offset..offset.checked_add(buf.len())?)
            });
            match region {
                Some(bytes) => {
                    buf.copy_from_slice(bytes);
                    true
                }
                None => false,
            }
        }
    }

    #[test]
    fn parses_a_normal_block() {
        let bytes = debug_block(CrtLayout::Legacy, block_use::NORMAL, 24);
        let header = sniff(&bytes, bytes.len()).unwrap();
        assert_eq!(header.size, 24);
        assert_eq!(header.line, 42);
        assert_eq!(header.request, 7);
        assert!(!header.is_runtime_owned());
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let bytes = debug_block(CrtLayout::Legacy, block_use::NORMAL, 24);
        assert!(sniff(&bytes, bytes.len() + 8).is_none());
    }

    #[test]
    fn broken_guard_is_rejected() {
        let mut bytes = debug_block(CrtLayout::Ucrt, block_use::NORMAL, 16);
        bytes[HEADER_LEN - 1] = 0;
        assert!(sniff(&bytes, bytes.len()).is_none());
    }

    #[test]
    fn invalid_use_tag_is_rejected() {
        let bytes = debug_block(CrtLayout::Legacy, 9, 16);
        assert!(sniff(&bytes, bytes.len()).is_none());
    }

    #[test]
    fn runtime_owned_tags() {
        let free = debug_block(CrtLayout::Legacy, block_use::FREE, 8);
        // FREE is not a valid live block type, so it never parses
        assert!(sniff(&free, free.len()).is_none());

        let internal = debug_block(CrtLayout::Legacy, block_use::INTERNAL, 8);
        assert!(sniff(&internal, internal.len()).unwrap().is_runtime_owned());

        let client = debug_block(CrtLayout::Legacy, block_use::CLIENT | 0x20000, 8);
        assert!(!sniff(&client, client.len()).unwrap().is_runtime_owned());
    }

    #[test]
    fn trusted_layout_reads_free_blocks() {
        let memory = FakeMemory::default();
        let bytes = debug_block(CrtLayout::Legacy, block_use::FREE, 8);
        let len = bytes.len();
        memory.insert(0x3000, bytes);

        let header = read_header(&memory, Address(0x3000), len, Some(CrtLayout::Legacy)).unwrap();
        assert!(header.is_runtime_owned());
    }

    #[test]
    fn plain_bytes_are_not_a_header() {
        let bytes = vec![0u8; 128];
        assert!(sniff(&bytes, bytes.len()).is_none());
    }

    #[test]
    fn read_header_goes_through_the_inspector() {
        let memory = FakeMemory::default();
        let bytes = debug_block(CrtLayout::Ucrt, block_use::NORMAL, 32);
        let len = bytes.len();
        memory.insert(0x1000, bytes);

        let header = read_header(&memory, Address(0x1000), len, None).unwrap();
        assert_eq!(header.size, 32);
        assert!(read_header(&memory, Address(0x2000), len, None).is_none());
        assert!(read_header(&NoInspection, Address(0x1000), len, None).is_none());
    }
}
