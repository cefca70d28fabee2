use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rand::RngCore;
use tempfile::TempDir;

use ole_storage::common::{is_regular_sect, END_OF_CHAIN, FREE_SECT, NO_STREAM};
use ole_storage::directory::{Color, ObjectType};
use ole_storage::{MajorVersion, Ole, OleError};

fn gen_buffer(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    buf
}

fn get_buffer(len: usize, value: u8) -> Vec<u8> {
    vec![value; len]
}

fn scratch(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

/// Every sector is either filed in allocation memory (tables and the free
/// list) or reachable from a stream chain or the mini stream chain.
fn assert_no_leaks(cf: &Ole) {
    let mut reachable = HashSet::new();
    for de in cf.directory().iter() {
        let chained = match de.object_type {
            ObjectType::Stream => de.size >= 4096,
            ObjectType::Root => true,
            _ => false,
        };
        if !chained || de.size == 0 || !is_regular_sect(de.start_sector_location) {
            continue;
        }
        let mut sec = de.start_sector_location;
        while is_regular_sect(sec) {
            assert!(
                reachable.insert(sec),
                "sector {sec} reachable from two chains"
            );
            sec = cf.sectors().get(sec).unwrap().next();
        }
    }
    for id in 0..cf.sectors().len() as u32 {
        assert!(
            cf.memory().find(id).is_some() || reachable.contains(&id),
            "sector {id} is neither filed nor reachable"
        );
    }
}

/// The persisted sibling pointers of a storage's children form a valid
/// red-black tree.
fn assert_rb_on_disk(cf: &Ole, storage_entry: u32) -> usize {
    fn walk(cf: &Ole, id: u32, seen: &mut HashSet<u32>) -> i32 {
        if id == NO_STREAM {
            return 1;
        }
        assert!(seen.insert(id), "entry {id} appears twice in a sibling tree");
        let de = cf.directory().get(id).unwrap();
        if de.color == Color::Red {
            for side in [de.left_sibling_id, de.right_sibling_id] {
                if side != NO_STREAM {
                    assert_eq!(
                        cf.directory().get(side).unwrap().color,
                        Color::Black,
                        "red entry {id} has a red child"
                    );
                }
            }
        }
        let lh = walk(cf, de.left_sibling_id, seen);
        let rh = walk(cf, de.right_sibling_id, seen);
        assert_eq!(lh, rh, "black height differs under entry {id}");
        lh + (de.color == Color::Black) as i32
    }

    let child = cf.directory().get(storage_entry).unwrap().child_id;
    if child != NO_STREAM {
        assert_eq!(cf.directory().get(child).unwrap().color, Color::Black);
    }
    let mut seen = HashSet::new();
    walk(cf, child, &mut seen);
    seen.len()
}

#[test]
fn write_stream() {
    const BUFFER_LENGTH: usize = 10_000;
    let data = gen_buffer(BUFFER_LENGTH);

    let mut cf = Ole::new(MajorVersion::Version3).unwrap();
    let mut root = cf.root_storage();
    let mut stream = root.add_stream("MyStream").unwrap();
    assert_eq!(stream.size(), 0);

    stream.set_data(&data).unwrap();
    assert_eq!(stream.size(), BUFFER_LENGTH as u64);
    assert_eq!(stream.get_data().unwrap(), data);
}

#[test]
fn write_mini_stream() {
    const BUFFER_LENGTH: usize = 1023;
    let data = gen_buffer(BUFFER_LENGTH);

    let mut cf = Ole::new(MajorVersion::Version3).unwrap();
    let mut root = cf.root_storage();
    let mut stream = root.add_stream("MyMiniStream").unwrap();
    stream.set_data(&data).unwrap();
    assert_eq!(stream.size(), BUFFER_LENGTH as u64);
    assert_eq!(stream.get_data().unwrap(), data);

    // below the cutoff the chain must live in the mini FAT
    let entry = cf
        .directory()
        .iter()
        .find(|de| de.name() == "MyMiniStream")
        .unwrap();
    let mut sec = entry.start_sector_location;
    let mut hops = 0;
    while is_regular_sect(sec) {
        sec = cf.mini_sectors().get(sec).unwrap().next();
        hops += 1;
    }
    assert_eq!(sec, END_OF_CHAIN);
    assert_eq!(hops, BUFFER_LENGTH.div_ceil(64));
}

#[test]
fn zero_length_stream_saves_and_reopens() {
    let dir = TempDir::new().unwrap();
    let path1 = scratch(&dir, "zero1.cfs");
    let path2 = scratch(&dir, "zero2.cfs");

    {
        let mut cf = Ole::new(MajorVersion::Version3).unwrap();
        let mut root = cf.root_storage();
        let mut stream = root.add_stream("MyStream").unwrap();
        stream.set_data(&[]).unwrap();
        assert_eq!(stream.size(), 0);
        cf.save(&path1).unwrap();
    }
    {
        let mut cf = Ole::open(&path1).unwrap();
        let mut root = cf.root_storage();
        let mut stream = root.get_stream("MyStream").unwrap();
        assert_eq!(stream.size(), 0);
        assert!(stream.get_data().unwrap().is_empty());

        stream.set_data(&[7u8; 30]).unwrap();
        cf.save(&path2).unwrap();
    }
    {
        let mut cf = Ole::open(&path2).unwrap();
        let mut root = cf.root_storage();
        let mut stream = root.get_stream("MyStream").unwrap();
        assert_eq!(stream.get_data().unwrap(), vec![7u8; 30]);
    }
}

#[test]
fn append_survives_save_and_reopen() {
    let dir = TempDir::new().unwrap();
    let path = scratch(&dir, "append.cfs");

    {
        let mut cf = Ole::new(MajorVersion::Version3).unwrap();
        let mut root = cf.root_storage();
        let mut stream = root.add_stream("MyStream").unwrap();
        stream.set_data(&[0, 1, 2, 3]).unwrap();
        stream.append(&[4, 5, 6, 7]).unwrap();
        cf.save(&path).unwrap();
    }

    let mut cf = Ole::open(&path).unwrap();
    let mut root = cf.root_storage();
    let mut stream = root.get_stream("MyStream").unwrap();
    assert_eq!(stream.get_data().unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn write_stream_with_difat() {
    // 15_345_665 / 512 sectors of data push the FAT well past the 109 header
    // DIFAT entries, forcing two DIFAT sectors.
    const SIZE: usize = 15_345_665;
    let data = get_buffer(SIZE, 0);
    let dir = TempDir::new().unwrap();
    let path = scratch(&dir, "difat.cfs");

    {
        let mut cf = Ole::new(MajorVersion::Version3).unwrap();
        let mut root = cf.root_storage();
        let mut stream = root.add_stream("MyStream").unwrap();
        stream.set_data(&data).unwrap();
        assert!(cf.header().num_fat_sectors > 109);
        assert_eq!(cf.header().num_difat_sectors, 2);
        cf.save(&path).unwrap();
    }

    let mut cf = Ole::open(&path).unwrap();
    assert_eq!(cf.header().num_difat_sectors, 2);
    let mut root = cf.root_storage();
    let mut stream = root.get_stream("MyStream").unwrap();
    assert_eq!(stream.size(), SIZE as u64);
    assert_eq!(stream.get_data().unwrap(), data);
    assert_no_leaks(&cf);
}

#[test]
fn mini_stream_promoted_to_regular() {
    const BIGGER_SIZE: usize = 350;
    const MEGA_SIZE: usize = 18_000_000;
    let dir = TempDir::new().unwrap();
    let path1 = scratch(&dir, "promote1.cfs");
    let path2 = scratch(&dir, "promote2.cfs");

    let buffers: Vec<Vec<u8>> = (1..=5).map(|i| get_buffer(BIGGER_SIZE, i as u8)).collect();
    let names = [
        "MyFirstStream",
        "MySecondStream",
        "MyThirdStream",
        "MyFourthStream",
        "MyFifthStream",
    ];

    {
        let mut cf = Ole::new(MajorVersion::Version3).unwrap();
        let mut root = cf.root_storage();
        for (name, buf) in names.iter().zip(&buffers) {
            let mut stream = root.add_stream(name).unwrap();
            stream.set_data(buf).unwrap();
            assert_eq!(stream.size(), BIGGER_SIZE as u64);
        }
        cf.save(&path1).unwrap();
    }

    let mega = gen_buffer(MEGA_SIZE);
    {
        let mut cf = Ole::open(&path1).unwrap();
        let mut root = cf.root_storage();
        let mut stream = root.get_stream("MySecondStream").unwrap();
        stream.set_data(&mega).unwrap();
        assert_eq!(stream.size(), MEGA_SIZE as u64);
        assert_eq!(stream.get_data().unwrap(), mega);

        // the six mini-sectors of the old 350-byte chain are free again
        assert!(cf.mini_sectors().free_len() >= 6);
        cf.save(&path2).unwrap();
    }

    let mut cf = Ole::open(&path2).unwrap();
    let mut root = cf.root_storage();
    let mut stream = root.get_stream("MySecondStream").unwrap();
    assert_eq!(stream.get_data().unwrap(), mega);
    for (name, buf) in names.iter().zip(&buffers) {
        if *name == "MySecondStream" {
            continue;
        }
        let mut stream = root.get_stream(name).unwrap();
        assert_eq!(stream.get_data().unwrap(), *buf);
    }
    assert!(cf.mini_sectors().free_len() >= 6);
    assert_no_leaks(&cf);
}

#[test]
fn shrink_regular_stream_in_place() {
    const BIG: usize = 10_000;
    const SMALL: usize = 8_000;
    let dir = TempDir::new().unwrap();
    let path = scratch(&dir, "shrink.cfs");

    let big = gen_buffer(BIG);
    let small = gen_buffer(SMALL);
    {
        let mut cf = Ole::new(MajorVersion::Version3).unwrap();
        let mut root = cf.root_storage();
        let mut stream = root.add_stream("Workbook").unwrap();
        stream.set_data(&big).unwrap();
        stream.set_data(&small).unwrap();
        cf.save(&path).unwrap();
    }

    let mut cf = Ole::open(&path).unwrap();
    let mut root = cf.root_storage();
    let mut stream = root.get_stream("Workbook").unwrap();
    assert_eq!(stream.get_data().unwrap(), small);
    // the four trailing sectors of the 10k chain went back to the free list
    assert!(cf.memory().len(ole_storage::memory::MemoryRole::Free) >= 4);
    assert_no_leaks(&cf);
}

#[test]
fn demote_regular_stream_to_mini() {
    let dir = TempDir::new().unwrap();
    let path = scratch(&dir, "demote.cfs");

    let small = gen_buffer(700);
    {
        let mut cf = Ole::new(MajorVersion::Version3).unwrap();
        let mut root = cf.root_storage();
        let mut stream = root.add_stream("S").unwrap();
        stream.set_data(&gen_buffer(9_000)).unwrap();
        stream.set_data(&small).unwrap();
        cf.save(&path).unwrap();
    }

    let mut cf = Ole::open(&path).unwrap();
    let mut root = cf.root_storage();
    let mut stream = root.get_stream("S").unwrap();
    assert_eq!(stream.get_data().unwrap(), small);
    let entry = cf.directory().iter().find(|de| de.name() == "S").unwrap();
    assert!(cf.mini_sectors().get(entry.start_sector_location).is_ok());
    assert_no_leaks(&cf);
}

#[test]
fn storage_tree_round_trips() {
    let dir = TempDir::new().unwrap();
    let path = scratch(&dir, "storages.cfs");
    let data = get_buffer(220, 0x0A);

    {
        let mut cf = Ole::new(MajorVersion::Version3).unwrap();
        let mut root = cf.root_storage();
        let mut storage = root.add_storage("MyStorage").unwrap();
        let mut stream = storage.add_stream("MyStream").unwrap();
        stream.set_data(&data).unwrap();
        cf.save(&path).unwrap();
    }

    let mut cf = Ole::open(&path).unwrap();
    let mut root = cf.root_storage();
    let mut storage = root.get_storage("MyStorage").unwrap();
    let mut stream = storage.get_stream("MyStream").unwrap();
    assert_eq!(stream.size(), 220);
    assert_eq!(stream.get_data().unwrap(), data);
}

#[test]
fn commit_adds_and_removes_streams_in_place() {
    let dir = TempDir::new().unwrap();
    let path = scratch(&dir, "commit.cfs");

    let alpha = gen_buffer(2_000);
    let summary = gen_buffer(300);
    {
        let mut cf = Ole::new(MajorVersion::Version3).unwrap();
        let mut root = cf.root_storage();
        root.add_stream("Alpha").unwrap().set_data(&alpha).unwrap();
        root.add_stream("\x05SummaryInformation")
            .unwrap()
            .set_data(&summary)
            .unwrap();
        cf.save(&path).unwrap();
    }

    let buffer = gen_buffer(5_000);
    {
        let mut cf = Ole::open(&path).unwrap();
        let mut root = cf.root_storage();
        root.delete("\x05SummaryInformation").unwrap();
        let mut added = root.add_stream("MyNewStream").unwrap();
        added.set_data(&buffer).unwrap();
        cf.commit().unwrap();
    }

    let mut cf = Ole::open(&path).unwrap();
    let mut root = cf.root_storage();
    let mut added = root.get_stream("MyNewStream").unwrap();
    assert_eq!(added.get_data().unwrap(), buffer);
    assert!(matches!(
        root.get_stream("\x05SummaryInformation"),
        Err(OleError::StreamNotFound(_))
    ));
    let mut alpha_stream = root.get_stream("Alpha").unwrap();
    assert_eq!(alpha_stream.get_data().unwrap(), alpha);
}

#[test]
fn commit_without_backing_file_fails() {
    let mut cf = Ole::new(MajorVersion::Version3).unwrap();
    assert!(matches!(cf.commit(), Err(OleError::Io(_))));
}

#[test]
fn delete_missing_child_reports_not_found() {
    let dir = TempDir::new().unwrap();
    let path = scratch(&dir, "delete.cfs");

    {
        let mut cf = Ole::new(MajorVersion::Version3).unwrap();
        let mut root = cf.root_storage();
        let mut storage = root.add_storage("MyStorage").unwrap();
        storage
            .add_stream("MyStream")
            .unwrap()
            .set_data(&get_buffer(100, 1))
            .unwrap();
        cf.save(&path).unwrap();
    }

    let mut cf = Ole::open(&path).unwrap();
    let mut root = cf.root_storage();
    let mut storage = root.get_storage("MyStorage").unwrap();
    assert!(matches!(
        storage.delete("MySecondStream"),
        Err(OleError::NotFoundDirectory)
    ));
    // the storage itself is fine
    storage.delete("MyStream").unwrap();
}

#[test]
fn deleting_a_storage_releases_its_subtree() {
    let mut cf = Ole::new(MajorVersion::Version3).unwrap();
    {
        let mut root = cf.root_storage();
        let mut storage = root.add_storage("Outer").unwrap();
        storage
            .add_stream("Inner1")
            .unwrap()
            .set_data(&gen_buffer(5_000))
            .unwrap();
        storage
            .add_stream("Inner2")
            .unwrap()
            .set_data(&gen_buffer(128))
            .unwrap();
        let mut nested = storage.add_storage("Nested").unwrap();
        nested
            .add_stream("Deep")
            .unwrap()
            .set_data(&gen_buffer(64))
            .unwrap();
    }
    let allocated_entries = cf
        .directory()
        .iter()
        .filter(|de| de.object_type != ObjectType::Unallocated)
        .count();
    assert_eq!(allocated_entries, 6);

    let mut root = cf.root_storage();
    root.delete("Outer").unwrap();
    drop(root);

    let allocated_entries = cf
        .directory()
        .iter()
        .filter(|de| de.object_type != ObjectType::Unallocated)
        .count();
    assert_eq!(allocated_entries, 1);
    // the 5000-byte chain came back to the free list
    assert!(cf.memory().len(ole_storage::memory::MemoryRole::Free) >= 10);
    assert_no_leaks(&cf);
}

#[test]
fn duplicate_names_are_rejected() {
    let mut cf = Ole::new(MajorVersion::Version3).unwrap();
    let mut root = cf.root_storage();
    root.add_stream("Twin").unwrap();
    assert!(matches!(
        root.add_stream("Twin"),
        Err(OleError::DuplicateName(_))
    ));
    // sibling comparison is case-insensitive, so this is the same name
    assert!(matches!(
        root.add_stream("TWIN"),
        Err(OleError::DuplicateName(_))
    ));
}

#[test]
fn lookup_is_case_insensitive() {
    let mut cf = Ole::new(MajorVersion::Version3).unwrap();
    let mut root = cf.root_storage();
    root.add_stream("Workbook").unwrap();
    assert!(root.get_stream("wOrKbOoK").is_ok());
}

#[test]
fn invalid_names_are_rejected() {
    let mut cf = Ole::new(MajorVersion::Version3).unwrap();
    let mut root = cf.root_storage();
    for name in ["bad\\name", "bad/name", "bad:name", "bad!name"] {
        assert!(matches!(
            root.add_stream(name),
            Err(OleError::InvalidName(_))
        ));
    }
    assert!(matches!(
        root.add_stream(&"x".repeat(32)),
        Err(OleError::NameTooLong(32))
    ));
}

#[test]
fn many_streams_grow_the_directory_chain() {
    const COUNT: usize = 254;
    let dir = TempDir::new().unwrap();
    let path = scratch(&dir, "many.cfs");
    let buffer = get_buffer(1995, 1);

    {
        let mut cf = Ole::new(MajorVersion::Version3).unwrap();
        let mut root = cf.root_storage();
        for i in 0..COUNT {
            let mut stream = root.add_stream(&format!("MyNewStream{i}")).unwrap();
            stream.set_data(&buffer).unwrap();
            assert_eq!(stream.get_data().unwrap(), buffer);
        }
        drop(root);
        assert!(cf.memory().len(ole_storage::memory::MemoryRole::DirectoryTable) > 1);
        cf.save(&path).unwrap();
    }

    let mut cf = Ole::open(&path).unwrap();
    assert_eq!(assert_rb_on_disk(&cf, 0), COUNT);
    let mut root = cf.root_storage();
    for i in (0..COUNT).step_by(17) {
        let mut stream = root.get_stream(&format!("MyNewStream{i}")).unwrap();
        assert_eq!(stream.get_data().unwrap(), buffer);
    }
    assert_no_leaks(&cf);
}

#[test]
fn persisted_siblings_stay_red_black_after_deletes() {
    let mut cf = Ole::new(MajorVersion::Version3).unwrap();
    {
        let mut root = cf.root_storage();
        for i in 0..25 {
            root.add_stream(&format!("Stream{i:02}")).unwrap();
        }
    }
    assert_rb_on_disk(&cf, 0);

    {
        let mut root = cf.root_storage();
        for i in [5, 24, 7, 0, 13] {
            root.delete(&format!("Stream{i:02}")).unwrap();
        }
    }
    assert_eq!(assert_rb_on_disk(&cf, 0), 20);
}

#[test]
fn version4_files_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = scratch(&dir, "v4.cfs");
    let data = gen_buffer(10_000);

    {
        let mut cf = Ole::new(MajorVersion::Version4).unwrap();
        assert_eq!(cf.sector_size(), 4096);
        let mut root = cf.root_storage();
        let mut stream = root.add_stream("MyStream").unwrap();
        stream.set_data(&data).unwrap();
        cf.save(&path).unwrap();
    }

    let expected_len = {
        let cf = Ole::open(&path).unwrap();
        assert_eq!(cf.version(), MajorVersion::Version4);
        512 + cf.sectors().len() as u64 * 4096
    };
    assert_eq!(std::fs::metadata(&path).unwrap().len(), expected_len);

    let mut cf = Ole::open(&path).unwrap();
    let mut root = cf.root_storage();
    let mut stream = root.get_stream("MyStream").unwrap();
    assert_eq!(stream.get_data().unwrap(), data);
}

#[test]
fn open_rejects_garbage() {
    let dir = TempDir::new().unwrap();

    let short = scratch(&dir, "short.bin");
    std::fs::write(&short, b"tiny").unwrap();
    assert!(matches!(Ole::open(&short), Err(OleError::WrongFormat)));

    let garbage = scratch(&dir, "garbage.bin");
    std::fs::write(&garbage, vec![0xAAu8; 4096]).unwrap();
    assert!(matches!(Ole::open(&garbage), Err(OleError::WrongFormat)));

    assert!(matches!(
        Ole::open(Path::new("/nonexistent/compound.cfs")),
        Err(OleError::Io(_))
    ));
}

#[test]
fn free_sectors_publish_freesect_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = scratch(&dir, "freed.cfs");

    {
        let mut cf = Ole::new(MajorVersion::Version3).unwrap();
        let mut root = cf.root_storage();
        let mut stream = root.add_stream("Doomed").unwrap();
        stream.set_data(&gen_buffer(6_000)).unwrap();
        root.delete("Doomed").unwrap();
        cf.save(&path).unwrap();
    }

    let cf = Ole::open(&path).unwrap();
    let free = cf.memory().len(ole_storage::memory::MemoryRole::Free);
    assert!(free >= 12, "expected the 6000-byte chain freed, got {free}");
    for id in 0..cf.sectors().len() as u32 {
        if cf.memory().find(id) == Some(ole_storage::memory::MemoryRole::Free) {
            assert_eq!(cf.sectors().get(id).unwrap().next(), FREE_SECT);
        }
    }
    assert_no_leaks(&cf);
}
