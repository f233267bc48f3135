// see [man mmap](https://man7.org/linux/man-pages/man2/mmap.2.html)
bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MmapProts: usize {
        const PROT_NONE = 0;  // Unaccessible. Used for guard pages.
        const PROT_READ = 1 << 0;
        const PROT_WRITE = 1 << 1;
        const PROT_EXEC  = 1 << 2;
        const PROT_GROWSDOWN = 0x01000000;
        const PROT_GROWSUP = 0x02000000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MmapFlags: usize {
        /// File mapping. Used for file initialization.(for compatibility, can be ignored)
        const MAP_FILE = 0;
        /// Changes to the mapping are visible to other processes mapping the same region,
        /// and are carried through to the underlying file.
        const MAP_SHARED = 0x01;
        /// Process private, copy-on-write.
        const MAP_PRIVATE = 0x02;
        /// Place the mapping at exactly `addr`; whatever overlaps is unmapped first.
        const MAP_FIXED = 0x10;
        /// Zero-filled mapping not backed by any file. `fd` is ignored.
        const MAP_ANONYMOUS = 0x20;
    }
}

impl MmapProts {
    /// Only the access bits; the grows-up/grows-down modifiers are dropped.
    pub fn access(self) -> Self {
        self & (Self::PROT_READ | Self::PROT_WRITE | Self::PROT_EXEC)
    }
}

impl MmapFlags {
    pub fn is_shared(self) -> bool {
        self.contains(Self::MAP_SHARED)
    }

    pub fn is_fixed(self) -> bool {
        self.contains(Self::MAP_FIXED)
    }

    pub fn is_anonymous(self) -> bool {
        self.contains(Self::MAP_ANONYMOUS)
    }
}
