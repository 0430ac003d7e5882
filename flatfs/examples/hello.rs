use tempfile;

use flatfs::config::ROOT_INO;
use flatfs::io::FileBlockEmulatorBuilder;
use flatfs::{FormatOptions, Volume};

const BLOCKS: usize = 256;

pub fn main() -> flatfs::Result<()> {
    let tmp = tempfile::tempfile().expect("Could not create backing file.");
    let dev = FileBlockEmulatorBuilder::from(tmp)
        .with_block_count(BLOCKS)
        .build()
        .expect("Could not initialize disk emulator.");

    // format a fresh volume and build a small tree under /
    let mut vol = Volume::format(dev, &FormatOptions::new(BLOCKS as u32))?;
    let docs = vol.mkdir(ROOT_INO, "docs", 0o755)?;
    let hello = vol.create(docs.ino, "hello.txt", 0o644)?;
    vol.write_file(hello.ino, 0, b"hello from a flat volume\n")?;
    vol.create(ROOT_INO, "empty", 0o600)?;

    for entry in vol.read_dir(docs.ino, ROOT_INO)? {
        let entry = entry?;
        println!("/docs/{:<12} ino={:<3} {:?}", entry.name, entry.ino, entry.file_type);
    }

    // hand the device back and mount it again from disk
    let fd = vol.unmount()?.into_file();
    let dev = FileBlockEmulatorBuilder::from(fd)
        .with_block_count(BLOCKS)
        .clear_medium(false)
        .build()
        .expect("Could not reopen disk emulator.");
    let mut vol = Volume::mount(dev)?;

    let ino = vol.lookup(docs.ino, "hello.txt")?;
    let mut buf = vec![0; 64];
    let n = vol.read_file(ino, 0, &mut buf)?;
    print!("{}", String::from_utf8_lossy(&buf[..n]));

    let stat = vol.statfs();
    println!(
        "{}/{} blocks free, {}/{} inodes free",
        stat.free_blocks, stat.blocks, stat.free_inodes, stat.inodes
    );
    vol.unmount()?;
    Ok(())
}
