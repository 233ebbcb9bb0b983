// Geometry and tunable limits.

pub const SECTOR_SIZE: usize = 512; // bytes per disk sector
pub const CACHE_SIZE: usize = 64; // block cache slots
pub const PGSIZE: usize = 4096; // bytes per page
pub const PG_SECTORS: usize = PGSIZE / SECTOR_SIZE; // sectors per page / swap slot
pub const NFRAME: usize = 64; // default user frame pool size
pub const NOFILE: usize = 128; // open files per process
pub const FD_BASE: usize = 2; // first file descriptor (0/1 are the console)

pub const PHYS_BASE: usize = 0xC000_0000; // first byte above user space
pub const STACK_LIMIT: usize = 1 << 23; // 8 MiB user stack cap
pub const STACK_SLOP: usize = 32; // PUSHA window below esp

// On-disk layout.
pub const INVALID_SECTOR: u32 = u32::MAX;
pub const FREE_MAP_SECTOR: u32 = 0; // inode of the free-map file
pub const ROOT_DIR_SECTOR: u32 = 1; // inode of the root directory
pub const DIRECT_CNT: usize = 123; // direct pointers per inode
pub const INODE_PTRS: usize = DIRECT_CNT + 2; // direct + single + double indirect
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / 4; // pointers per indirect sector
pub const INODE_MAGIC: u32 = 0x494e_4f44;
pub const NAME_MAX: usize = 14; // directory entry name limit

pub const MAX_FILE_SECTORS: usize =
    DIRECT_CNT + PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR;
pub const MAX_FILE_BYTES: usize = MAX_FILE_SECTORS * SECTOR_SIZE;
