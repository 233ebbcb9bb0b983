// mkfs: builds a formatted disk image and optionally preloads host
// files into its root directory.
//
//   mkfs fs.img [sectors] [file ...]

use kernel::block::FileDisk;
use kernel::file::File;
use kernel::filesys::Filesys;
use kernel::param::SECTOR_SIZE;
use std::env;
use std::io::Read;
use std::path::Path;
use std::process;

const DEFAULT_SECTORS: u32 = 4096; // 2 MiB

fn die(msg: &str) -> ! {
    eprintln!("mkfs: {}", msg);
    process::exit(1);
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        die("usage: mkfs IMAGE [SECTORS] [FILE ...]");
    }

    let image = &args[0];
    let (sectors, files) = match args.get(1).and_then(|a| a.parse::<u32>().ok()) {
        Some(n) => (n, &args[2..]),
        None => (DEFAULT_SECTORS, &args[1..]),
    };

    let dev = match FileDisk::create(image, sectors) {
        Ok(dev) => dev,
        Err(e) => die(&format!("cannot create {}: {}", image, e)),
    };
    let fs = Filesys::mount(dev, true, None);

    for path in files {
        let name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_else(|| die(&format!("bad file name: {}", path)));
        let mut data = Vec::new();
        match std::fs::File::open(path) {
            Ok(mut f) => {
                if f.read_to_end(&mut data).is_err() {
                    die(&format!("cannot read {}", path));
                }
            }
            Err(e) => die(&format!("cannot open {}: {}", path, e)),
        }

        if let Err(e) = fs.create(None, name, 0) {
            die(&format!("cannot create /{}: {}", name, e));
        }
        let inode = match fs.open(None, name) {
            Ok(inode) => inode,
            Err(e) => die(&format!("cannot open /{}: {}", name, e)),
        };
        let file = File::open(inode);
        if file.write(&data) != data.len() {
            die(&format!("short write for /{} (image full?)", name));
        }
        println!("mkfs: /{} {} bytes", name, data.len());
    }

    fs.flush();
    println!(
        "mkfs: {} sectors ({} KiB), {} free",
        sectors,
        sectors as usize * SECTOR_SIZE / 1024,
        fs.free_sectors()
    );
}
