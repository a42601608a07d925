mod common;

use std::io::SeekFrom;

use common::{config, rnode};
use smgr::{SegmentMode, StorageKind};

#[test]
fn segments_round_trip_data() {
    common::setup_logger();
    let config = config();
    let path = config.path.clone();
    let smgr = config.open().unwrap();
    let rel = smgr.open_with_kind(rnode(40), StorageKind::AoRows).unwrap();
    let segments = smgr.segments(&rel).unwrap();

    assert!(segments.create(0, false).unwrap());
    assert!(segments.create(1, false).unwrap());
    assert!(segments.create(1, false).unwrap_err().is_already_exists());
    assert!(!segments.create(1, true).unwrap());

    assert!(path.join("base/1/40").exists());
    assert!(path.join("base/1/40.1").exists());
    assert!(path.join("base/1/40.1.modcount").exists());

    let mut file = segments.open(1, SegmentMode::ReadWrite, 0).unwrap();
    assert_eq!(segments.write(&mut file, b"hello, ").unwrap(), 7);
    assert_eq!(segments.write(&mut file, b"segment").unwrap(), 7);
    assert_eq!(segments.position(&mut file).unwrap(), 14);
    segments.sync(&mut file).unwrap();

    assert_eq!(segments.seek(&mut file, SeekFrom::Start(7)).unwrap(), 7);
    let mut buf = [0; 32];
    let n = segments.read(&mut file, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"segment");
    segments.close(file).unwrap();

    let err = segments.open(5, SegmentMode::Read, 0).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn truncation_makes_other_opens_stale() {
    common::setup_logger();
    let smgr = config().open().unwrap();
    let rel = smgr.open_with_kind(rnode(41), StorageKind::AoColumns).unwrap();
    let segments = smgr.segments(&rel).unwrap();

    segments.create(0, false).unwrap();
    let mut writer = segments.open(0, SegmentMode::ReadWrite, 0).unwrap();
    let mut reader = segments.open(0, SegmentMode::Read, 0).unwrap();
    segments.write(&mut writer, &[9; 100]).unwrap();

    segments.truncate(&mut writer, 40).unwrap();
    assert_eq!(writer.modcount(), 1);
    assert_eq!(segments.position(&mut writer).unwrap(), 40);

    let mut buf = [0; 8];
    assert!(segments.read(&mut reader, &mut buf).unwrap_err().is_invalid_state());
    assert!(segments.open(0, SegmentMode::Read, 0).unwrap_err().is_invalid_state());

    let mut reader = segments.open(0, SegmentMode::Read, 1).unwrap();
    assert_eq!(segments.seek(&mut reader, SeekFrom::End(0)).unwrap(), 40);

    // read-only files can be neither written nor truncated
    assert!(segments.write(&mut reader, b"x").unwrap_err().is_invalid_state());
    assert!(segments.truncate(&mut reader, 0).unwrap_err().is_invalid_state());
}

#[test]
fn modification_counts_survive_a_restart() {
    common::setup_logger();
    let config = config();

    {
        let smgr = config.open().unwrap();
        let rel = smgr.open_with_kind(rnode(42), StorageKind::AoRows).unwrap();
        let segments = smgr.segments(&rel).unwrap();
        segments.create(0, false).unwrap();
        let mut file = segments.open(0, SegmentMode::ReadWrite, 0).unwrap();
        segments.truncate(&mut file, 0).unwrap();
        segments.truncate(&mut file, 0).unwrap();
    }

    let smgr = config.open().unwrap();
    let rel = smgr.open_with_kind(rnode(42), StorageKind::AoRows).unwrap();
    let segments = smgr.segments(&rel).unwrap();
    assert!(segments.open(0, SegmentMode::Read, 0).unwrap_err().is_invalid_state());
    segments.open(0, SegmentMode::Read, 2).unwrap();
}

#[test]
fn unlink_removes_every_segment() {
    common::setup_logger();
    let config = config();
    let path = config.path.clone();
    let smgr = config.open().unwrap();

    let rel = smgr.open_with_kind(rnode(43), StorageKind::AoRows).unwrap();
    let neighbour = smgr.open_with_kind(rnode(430), StorageKind::AoRows).unwrap();
    {
        let segments = smgr.segments(&rel).unwrap();
        for segno in [0, 1, 2, 12] {
            segments.create(segno, false).unwrap();
        }
        smgr.segments(&neighbour).unwrap().create(0, false).unwrap();
    }

    let report = smgr.unlink_relation(&rel, false);
    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(report.unlinked_count(), 1);

    for name in ["43", "43.1", "43.2", "43.12", "43.modcount", "43.12.modcount"] {
        assert!(!path.join("base/1").join(name).exists(), "{} survived", name);
    }
    assert!(path.join("base/1/430").exists());

    let report = smgr.unlink_relation(&rel, false);
    assert_eq!(report.failures().len(), 1);
    let (fork, error) = &report.failures()[0].errors[0];
    assert!(error.is_not_found());
    assert_eq!(*fork, None);
    assert_eq!(report.unlinked_count(), 0);
}

#[test]
fn closed_handles_refuse_segment_access() {
    common::setup_logger();
    let smgr = config().open().unwrap();
    let rel = smgr.open_with_kind(rnode(44), StorageKind::AoRows).unwrap();

    smgr.segments(&rel).unwrap().create(0, false).unwrap();
    smgr.close(&rel);

    let segments = smgr.segments(&rel).unwrap();
    assert!(segments.open(0, SegmentMode::Read, 0).unwrap_err().is_invalid_state());
}
