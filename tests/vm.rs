// Virtual memory scenarios: stack growth and its cap, eviction under
// frame pressure, mmap write-back, swap round trips, fork, and exit
// teardown.

use kernel::block::MemDisk;
use kernel::file::File;
use kernel::param::{PGSIZE, PHYS_BASE};
use kernel::{Kernel, KernelOptions};
use std::sync::Arc;

const MB: usize = 1024 * 1024;

fn boot() -> Arc<Kernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    Kernel::new(
        MemDisk::new(8192),
        MemDisk::new(8192), // 1024 swap slots
        KernelOptions::default(),
    )
}

// Simulates the thread pushing its stack down to `addr` and storing.
fn push(p: &kernel::proc::Process, addr: usize, byte: u8) {
    p.user_store(addr, byte, Some(addr)).unwrap();
}

#[test]
fn stack_grows_below_esp_and_respects_the_cap() {
    let kernel = boot();
    let p = kernel.spawn();

    // A PUSHA 32 bytes under esp four megabytes down: a fresh
    // zero-filled page appears.
    let esp = PHYS_BASE - 4 * MB;
    p.user_store(esp - 32, 7, Some(esp)).unwrap();
    assert_eq!(p.user_load(esp - 32, Some(esp)).unwrap(), 7);
    // The rest of the page came up zeroed.
    assert_eq!(p.user_load(esp - 31, Some(esp)).unwrap(), 0);

    // Nine megabytes down is past the cap: the process dies with -1.
    let q = kernel.spawn();
    let esp = PHYS_BASE - 9 * MB;
    assert!(q.user_store(esp - 32, 7, Some(esp)).is_err());
    assert_eq!(q.exit_code(), Some(-1));
    assert!(p.alive());
}

#[test]
fn far_from_esp_is_not_stack_growth() {
    let kernel = boot();
    let p = kernel.spawn();
    let esp = PHYS_BASE - MB;
    // Wild pointer well below the window.
    assert!(p.user_store(esp - 100 * PGSIZE, 1, Some(esp)).is_err());
    assert_eq!(p.exit_code(), Some(-1));
}

#[test]
fn mmap_write_back_on_eviction() {
    let kernel = boot();
    let p = kernel.spawn();

    // A file of 8192 'A's, mapped at a fixed address.
    assert!(kernel.sys_create(&p, "/m", 0));
    {
        let inode = kernel.fs.open(None, "/m").unwrap();
        let f = File::open(inode);
        assert_eq!(f.write_at(&vec![b'A'; 2 * PGSIZE], 0), 2 * PGSIZE);
    }
    let fd = kernel.sys_open(&p, "/m") as usize;
    let addr = 0x1000_0000;
    let mapid = kernel.sys_mmap(&p, fd, addr);
    assert!(mapid >= 0);

    p.user_store(addr, b'B', None).unwrap();
    assert_eq!(p.user_load(addr + 1, None).unwrap(), b'A');

    // Enough stack pages to turn the pool over and evict the mapping.
    for i in 0..kernel.frames.pool().len() + 16 {
        push(&p, PHYS_BASE - (i + 1) * PGSIZE, i as u8);
    }

    // The dirty mapped page reached the file on its way out.
    let check = File::open(kernel.fs.open(None, "/m").unwrap());
    let mut byte = [0u8; 2];
    assert_eq!(check.read_at(&mut byte, 0), 2);
    assert_eq!(byte[0], b'B');
    assert_eq!(byte[1], b'A');
}

#[test]
fn munmap_writes_dirty_pages_back() {
    let kernel = boot();
    let p = kernel.spawn();

    assert!(kernel.sys_create(&p, "/m", 0));
    {
        let f = File::open(kernel.fs.open(None, "/m").unwrap());
        assert_eq!(f.write_at(&vec![b'.'; PGSIZE], 0), PGSIZE);
    }
    let fd = kernel.sys_open(&p, "/m") as usize;
    let addr = 0x2000_0000;
    let mapid = kernel.sys_mmap(&p, fd, addr);
    assert!(mapid >= 0);

    p.user_store(addr + 10, b'!', None).unwrap();
    kernel.sys_munmap(&p, mapid);

    let f = File::open(kernel.fs.open(None, "/m").unwrap());
    let mut buf = [0u8; 16];
    assert_eq!(f.read_at(&mut buf, 0), 16);
    assert_eq!(buf[10], b'!');

    // The pages are gone: touching the address now is a wild access.
    assert!(p.user_load(addr, None).is_err());
    assert_eq!(p.exit_code(), Some(-1));
}

#[test]
fn mmap_argument_validation() {
    let kernel = boot();
    let p = kernel.spawn();

    assert!(kernel.sys_create(&p, "/f", 0));
    {
        let f = File::open(kernel.fs.open(None, "/f").unwrap());
        f.write_at(b"data", 0);
    }
    assert!(kernel.sys_create(&p, "/empty", 0));
    let fd = kernel.sys_open(&p, "/f") as usize;
    let empty_fd = kernel.sys_open(&p, "/empty") as usize;

    assert_eq!(kernel.sys_mmap(&p, fd, 0), -1, "null address");
    assert_eq!(kernel.sys_mmap(&p, fd, 0x1000_0004), -1, "unaligned");
    assert_eq!(kernel.sys_mmap(&p, 77, 0x1000_0000), -1, "bad fd");
    assert_eq!(kernel.sys_mmap(&p, empty_fd, 0x1000_0000), -1, "empty file");

    // Overlap with anything already mapped is refused, the loaded
    // image included.
    let segf = File::open(kernel.fs.open(None, "/f").unwrap());
    p.load_segment(&segf, 0, 0x3000_0000, 0, PGSIZE, true).unwrap();
    assert_eq!(kernel.sys_mmap(&p, fd, 0x3000_0000), -1, "overlaps image");

    let ok = kernel.sys_mmap(&p, fd, 0x1000_0000);
    assert!(ok >= 0);
    assert_eq!(kernel.sys_mmap(&p, fd, 0x1000_0000), -1, "overlaps mapping");
}

#[test]
fn anonymous_pages_survive_a_trip_through_swap() {
    let kernel = boot();
    let p = kernel.spawn();

    let frames = kernel.frames.pool().len();
    let pages = frames + 32;
    for i in 0..pages {
        push(&p, PHYS_BASE - (i + 1) * PGSIZE, (i % 251) as u8);
    }
    // Early pages were evicted to swap.
    assert!(kernel.frames.swap().used_slots() > 0);

    // Touching them again faults each one back in with its contents.
    for i in 0..pages {
        let addr = PHYS_BASE - (i + 1) * PGSIZE;
        assert_eq!(
            p.user_load(addr, Some(addr)).unwrap(),
            (i % 251) as u8,
            "page {} lost through swap",
            i
        );
    }
}

#[test]
fn dirty_segment_pages_promote_to_swap_not_the_file() {
    let kernel = boot();
    let p = kernel.spawn();

    // A writable "data segment" backed by a file of dots.
    assert!(kernel.sys_create(&p, "/img", 0));
    {
        let f = File::open(kernel.fs.open(None, "/img").unwrap());
        assert_eq!(f.write_at(&vec![b'.'; PGSIZE], 0), PGSIZE);
    }
    let seg = 0x4000_0000;
    let segf = File::open(kernel.fs.open(None, "/img").unwrap());
    p.load_segment(&segf, 0, seg, PGSIZE, 0, true).unwrap();

    p.user_store(seg, b'D', None).unwrap();

    // Evict everything by stack pressure.
    for i in 0..kernel.frames.pool().len() + 16 {
        push(&p, PHYS_BASE - (i + 1) * PGSIZE, 0);
    }

    // The file is untouched; the modified byte comes back from swap.
    let f = File::open(kernel.fs.open(None, "/img").unwrap());
    let mut b = [0u8; 1];
    f.read_at(&mut b, 0);
    assert_eq!(b[0], b'.', "segment eviction must not write the file");
    assert_eq!(p.user_load(seg, None).unwrap(), b'D');
}

#[test]
fn read_only_segment_faults_kill_writers() {
    let kernel = boot();
    let p = kernel.spawn();

    assert!(kernel.sys_create(&p, "/ro", 0));
    {
        let f = File::open(kernel.fs.open(None, "/ro").unwrap());
        assert_eq!(f.write_at(&vec![b'r'; PGSIZE], 0), PGSIZE);
    }
    let seg = 0x5000_0000;
    {
        let f = File::open(kernel.fs.open(None, "/ro").unwrap());
        p.load_segment(&f, 0, seg, PGSIZE, 0, false).unwrap();
    }

    assert_eq!(p.user_load(seg, None).unwrap(), b'r');
    assert!(p.user_store(seg, b'x', None).is_err());
    assert_eq!(p.exit_code(), Some(-1));
}

#[test]
fn fork_copies_the_address_space() {
    let kernel = boot();
    let p = kernel.spawn();

    let a = PHYS_BASE - PGSIZE;
    let b = PHYS_BASE - 2 * PGSIZE;
    push(&p, a, 1);
    push(&p, b, 2);

    // Swap one page out before forking so the slot-duplication path
    // runs too.
    for i in 2..kernel.frames.pool().len() + 18 {
        push(&p, PHYS_BASE - (i + 1) * PGSIZE, 0);
    }

    let child = p.fork().unwrap();
    assert_eq!(child.user_load(a, None).unwrap(), 1);
    assert_eq!(child.user_load(b, None).unwrap(), 2);

    // Copies diverge.
    child.user_store(a, 100, None).unwrap();
    assert_eq!(p.user_load(a, None).unwrap(), 1);
    assert_eq!(child.user_load(a, None).unwrap(), 100);

    child.exit(0);
    assert_eq!(p.user_load(a, None).unwrap(), 1);
}

#[test]
fn exit_returns_every_frame_and_swap_slot() {
    let kernel = boot();
    let p = kernel.spawn();

    assert!(kernel.sys_create(&p, "/m", 0));
    {
        let f = File::open(kernel.fs.open(None, "/m").unwrap());
        assert_eq!(f.write_at(&vec![b'm'; PGSIZE], 0), PGSIZE);
    }
    let fd = kernel.sys_open(&p, "/m") as usize;
    assert!(kernel.sys_mmap(&p, fd, 0x1000_0000) >= 0);
    p.user_store(0x1000_0000, b'M', None).unwrap();

    for i in 0..kernel.frames.pool().len() + 8 {
        push(&p, PHYS_BASE - (i + 1) * PGSIZE, 9);
    }
    assert!(kernel.frames.used_frames() > 0);
    assert!(kernel.frames.swap().used_slots() > 0);

    kernel.sys_exit(&p, 0);
    assert_eq!(p.exit_code(), Some(0));
    assert_eq!(kernel.frames.used_frames(), 0);
    assert_eq!(kernel.frames.swap().used_slots(), 0);

    // The dirty mapping reached the file during teardown.
    let f = File::open(kernel.fs.open(None, "/m").unwrap());
    let mut b = [0u8; 1];
    f.read_at(&mut b, 0);
    assert_eq!(b[0], b'M');
}

#[test]
fn eviction_under_concurrent_pressure_keeps_contents() {
    let kernel = boot();
    let mut handles = Vec::new();
    for t in 0..4 {
        let kernel = Arc::clone(&kernel);
        handles.push(std::thread::spawn(move || {
            let p = kernel.spawn();
            let pages = kernel.frames.pool().len() / 2;
            for i in 0..pages {
                push(&p, PHYS_BASE - (i + 1) * PGSIZE, (t * 50 + i) as u8);
            }
            for i in 0..pages {
                let addr = PHYS_BASE - (i + 1) * PGSIZE;
                assert_eq!(
                    p.user_load(addr, Some(addr)).unwrap(),
                    (t * 50 + i) as u8
                );
            }
            p.exit(0);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(kernel.frames.used_frames(), 0);
    assert_eq!(kernel.frames.swap().used_slots(), 0);
}
