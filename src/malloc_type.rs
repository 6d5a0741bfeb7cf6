//! Malloc types: the purpose tag every allocation is charged to.
//!
//! The type only selects a statistics record and its limit; it never changes
//! how memory is carved.

use core::fmt;

static NAMES: [&str; MallocType::COUNT] = [
    "free",
    "devbuf",
    "pcb",
    "rtable",
    "ifaddr",
    "soopts",
    "sysctl",
    "counters",
    "ioctlops",
    "iov",
    "mount",
    "NFS req",
    "NFS mount",
    "vnodes",
    "namecache",
    "UFS quota",
    "UFS mount",
    "shm",
    "VM map",
    "sem",
    "dirhash",
    "file desc",
    "proc",
    "subproc",
    "export host",
    "exec",
    "ttys",
    "crypto data",
    "USB",
    "pipe",
    "temp",
];

/// Purpose tag of an allocation (`M_*`).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MallocType(u16);

impl MallocType {
    pub const FREE: Self = Self(0);
    pub const DEVBUF: Self = Self(1);
    pub const PCB: Self = Self(2);
    pub const RTABLE: Self = Self(3);
    pub const IFADDR: Self = Self(4);
    pub const SOOPTS: Self = Self(5);
    pub const SYSCTL: Self = Self(6);
    pub const COUNTERS: Self = Self(7);
    pub const IOCTLOPS: Self = Self(8);
    pub const IOV: Self = Self(9);
    pub const MOUNT: Self = Self(10);
    pub const NFSREQ: Self = Self(11);
    pub const NFSMNT: Self = Self(12);
    pub const VNODE: Self = Self(13);
    pub const CACHE: Self = Self(14);
    pub const DQUOT: Self = Self(15);
    pub const UFSMNT: Self = Self(16);
    pub const SHM: Self = Self(17);
    pub const VMMAP: Self = Self(18);
    pub const SEM: Self = Self(19);
    pub const DIRHASH: Self = Self(20);
    pub const FILEDESC: Self = Self(21);
    pub const PROC: Self = Self(22);
    pub const SUBPROC: Self = Self(23);
    pub const NETADDR: Self = Self(24);
    pub const EXEC: Self = Self(25);
    pub const TTYS: Self = Self(26);
    pub const CRYPTO_DATA: Self = Self(27);
    pub const USB: Self = Self(28);
    pub const PIPE: Self = Self(29);
    pub const TEMP: Self = Self(30);

    /// Number of malloc types (`M_LAST`).
    pub const COUNT: usize = 31;

    /// Returns `None` for ids at or beyond [`Self::COUNT`].
    pub const fn new(id: u16) -> Option<Self> {
        if (id as usize) < Self::COUNT {
            Some(Self(id))
        } else {
            None
        }
    }

    pub const fn id(self) -> usize {
        self.0 as usize
    }

    pub fn name(self) -> &'static str {
        NAMES[self.id()]
    }

    pub fn all() -> impl Iterator<Item = Self> {
        (0..Self::COUNT as u16).map(Self)
    }
}

impl fmt::Debug for MallocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MallocType({})", self.name())
    }
}

impl fmt::Display for MallocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
