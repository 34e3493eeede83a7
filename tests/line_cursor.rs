// Line cursor integration tests: full vs chunked reads, reset cycles, growth writes.
use std::path::Path;

use tickmerge::api::{Durability, ErrorKind, LineCursor, OpenMode};

fn read_all(cursor: &mut LineCursor) -> Vec<Vec<u8>> {
    cursor
        .lines()
        .map(|line| line.expect("line").to_vec())
        .collect()
}

fn sample_contents() -> Vec<u8> {
    let mut contents = Vec::new();
    for i in 0..200 {
        contents.extend_from_slice(format!("2021-03-05 09:{:02}:00.000,{i},{}\n", i % 60, "x".repeat(i % 37)).as_bytes());
        if i % 17 == 0 {
            contents.push(b'\n');
        }
    }
    contents.extend_from_slice(b"unterminated tail");
    contents
}

fn write_sample(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("ticks.AAPL");
    std::fs::write(&path, sample_contents()).expect("write");
    path
}

#[test]
fn lines_plus_terminators_cover_the_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_sample(dir.path());
    let contents = sample_contents();

    let mut cursor = LineCursor::open(&path, OpenMode::ReadOnly).expect("open");
    let lines = read_all(&mut cursor);
    let terminators = contents.iter().filter(|byte| **byte == b'\n').count();
    let total: usize = lines.iter().map(Vec::len).sum::<usize>() + terminators;
    assert_eq!(total as u64, cursor.file_len().expect("len"));
    assert_eq!(total, contents.len());
}

#[test]
fn reset_replays_the_same_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_sample(dir.path());

    let mut cursor = LineCursor::open(&path, OpenMode::ReadOnly).expect("open");
    let first = read_all(&mut cursor);
    for _ in 0..3 {
        cursor.reset().expect("reset");
        assert_eq!(read_all(&mut cursor), first);
    }
}

#[test]
fn chunked_reads_match_full_mapping_for_any_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_sample(dir.path());

    let mut full = LineCursor::open(&path, OpenMode::ReadOnly).expect("open");
    let expected = read_all(&mut full);

    for window in [1, 2, 7, 16, 63, 100, 4096, 1 << 20] {
        let mut chunked =
            LineCursor::open_window(&path, 0, window, OpenMode::ReadOnly).expect("open window");
        assert_eq!(read_all(&mut chunked), expected, "window {window}");
        assert!(chunked.is_eof());
    }
}

#[test]
fn empty_line_on_window_boundary_is_kept() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("gaps.txt");
    std::fs::write(&path, b"abc\n\ndef\n\n\n").expect("write");

    let mut cursor = LineCursor::open_window(&path, 0, 4, OpenMode::ReadOnly).expect("open");
    let lines = read_all(&mut cursor);
    assert_eq!(
        lines,
        [b"abc".to_vec(), Vec::new(), b"def".to_vec(), Vec::new(), Vec::new()]
    );
    assert!(cursor.generation() > 0);
}

#[test]
fn written_lines_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("out.csv");
    let expected: Vec<String> = (0..500)
        .map(|i| format!("AAPL,2021-03-05 10:00:{:02}.000,{i}", i % 60))
        .collect();

    let mut writer = LineCursor::open(&path, OpenMode::ReadWrite)
        .expect("open")
        .with_durability(Durability::Deferred);
    for line in &expected {
        writer.write_line(line).expect("write");
    }
    assert!(writer.generation() > 1);
    writer.finish().expect("finish");

    let mut reader = LineCursor::open(&path, OpenMode::ReadOnly).expect("reopen");
    let lines: Vec<String> = reader
        .lines()
        .map(|line| line.expect("line").to_string())
        .collect();
    assert_eq!(lines, expected);
}

#[test]
fn dropped_writer_trims_padding() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("dropped.csv");
    {
        let mut writer = LineCursor::open(&path, OpenMode::WriteOnly).expect("open");
        for i in 0..10 {
            writer.write_line(format!("line {i}")).expect("write");
        }
    }
    let contents = std::fs::read_to_string(&path).expect("read");
    assert_eq!(contents.lines().count(), 10);
    assert!(contents.ends_with("line 9\n"));
}

#[test]
fn writer_lock_is_exclusive_until_drop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("locked.csv");

    let writer = LineCursor::open(&path, OpenMode::ReadWrite).expect("first");
    let err = match LineCursor::open(&path, OpenMode::ReadWrite) {
        Ok(_) => panic!("expected lock contention"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::OpenFailed);
    assert_eq!(err.hint(), Some("another writer holds the file"));

    let reader = LineCursor::open(&path, OpenMode::ReadOnly).expect("readers are not locked");
    assert!(reader.is_valid());

    drop(writer);
    LineCursor::open(&path, OpenMode::ReadWrite).expect("lock released");
}

#[test]
fn view_is_zero_copy_inside_one_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("view.txt");
    std::fs::write(&path, b"first\nsecond\n").expect("write");

    let mut cursor = LineCursor::open(&path, OpenMode::ReadOnly).expect("open");
    let view = cursor.read_line_view(false).expect("view");
    assert!(view.is_zero_copy());
    assert_eq!(view.as_bytes(), b"first");
    assert_eq!(view.to_bstring(), "first");
    drop(view);
    let bounds = cursor.next_line_bounds(false).expect("bounds");
    assert_eq!((bounds.start, bounds.end, bounds.prefix_len), (6, 12, 0));
    assert_eq!(cursor.position(), Some(13));
}
