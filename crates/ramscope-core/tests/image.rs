//! Tests for segment lookup and manifest loading.

use ramscope_core::image::{manifest, MemoryImage, MemorySegment};
use ramscope_core::types::PhysAddr;
use ramscope_core::AnalysisError;
use tempfile::TempDir;

fn two_ddr_image(dir: &TempDir) -> MemoryImage
{
    let ddr1: Vec<u8> = (0u32..0x100).flat_map(u32::to_le_bytes).collect();
    let ddr2: Vec<u8> = (0x8000u32..0x8100).flat_map(u32::to_le_bytes).collect();
    let path1 = dir.path().join("DDRCS0.BIN");
    let path2 = dir.path().join("DDRCS1.BIN");
    std::fs::write(&path1, &ddr1).unwrap();
    std::fs::write(&path2, &ddr2).unwrap();
    MemoryImage::new(vec![
        MemorySegment::new(path2, 0x9000_0000, 0x9000_0000 + ddr2.len() as u64 - 1, "DDRCS1".to_string()),
        MemorySegment::new(path1, 0x8000_0000, 0x8000_0000 + ddr1.len() as u64 - 1, "DDRCS0".to_string()),
    ])
}

#[test]
fn test_read_physical_hits_the_covering_segment()
{
    let dir = TempDir::new().unwrap();
    let image = two_ddr_image(&dir);

    // Offset 0x10 of the first segment holds the fifth u32 (value 4).
    let bytes = image.read_physical(PhysAddr::new(0x8000_0010), 4).unwrap();
    assert_eq!(bytes, 4u32.to_le_bytes());

    // Second segment, offset 8.
    let bytes = image.read_physical(PhysAddr::new(0x9000_0008), 4).unwrap();
    assert_eq!(bytes, 0x8002u32.to_le_bytes());
}

#[test]
fn test_read_physical_outside_all_segments_is_a_hole()
{
    let dir = TempDir::new().unwrap();
    let image = two_ddr_image(&dir);

    assert!(image.read_physical(PhysAddr::new(0xa000_0000), 4).is_none());
    // Below the first segment.
    assert!(image.read_physical(PhysAddr::new(0x7fff_fffc), 4).is_none());
    // In the gap between the two segments.
    assert!(image.read_physical(PhysAddr::new(0x8000_1000), 4).is_none());
}

#[test]
fn test_reads_never_span_segments()
{
    let dir = TempDir::new().unwrap();
    let image = two_ddr_image(&dir);

    // A read starting near the end of a segment is clamped at the file
    // end rather than continued into the next segment.
    let bytes = image.read_physical(PhysAddr::new(0x8000_03fc), 16).unwrap();
    assert_eq!(bytes.len(), 4);
}

#[test]
fn test_extents_are_sorted_ascending()
{
    let dir = TempDir::new().unwrap();
    let image = two_ddr_image(&dir);

    let extents = image.extents();
    assert_eq!(extents.len(), 2);
    assert_eq!(extents[0].0, PhysAddr::new(0x8000_0000));
    assert_eq!(extents[0].2, "DDRCS0");
    assert_eq!(extents[1].0, PhysAddr::new(0x9000_0000));
}

#[test]
fn test_base_phys_offset_prefers_ddr()
{
    let dir = TempDir::new().unwrap();
    let imem = dir.path().join("OCIMEM.BIN");
    let ddr = dir.path().join("DDRCS0.BIN");
    std::fs::write(&imem, vec![0u8; 64]).unwrap();
    std::fs::write(&ddr, vec![0u8; 64]).unwrap();

    // The IMEM segment sits below the DDR segment, but DDR wins.
    let image = MemoryImage::new(vec![
        MemorySegment::new(imem, 0x0860_0000, 0x0860_003f, "OCIMEM".to_string()),
        MemorySegment::new(ddr, 0x8000_0000, 0x8000_003f, "DDRCS0".to_string()),
    ]);
    assert_eq!(image.base_phys_offset(), Some(0x8000_0000));
}

#[test]
fn test_table_manifest_loads_matching_sizes()
{
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("DDRCS0.BIN"), vec![0xaa; 4096]).unwrap();
    std::fs::write(dir.path().join("DDRCS1.BIN"), vec![0xbb; 2048]).unwrap();
    std::fs::write(
        dir.path().join("dump_info.txt"),
        "1 0x80000000 4096 DDRCS0.BIN\n2 0x90000000 4000 DDRCS1.BIN\n3 0x10000000 64 notes.txt\n",
    )
    .unwrap();

    let image = manifest::load_dump_directory(dir.path()).unwrap();
    let extents = image.extents();
    // The second file's recorded size disagrees with the on-disk size, so
    // it is skipped with a warning; the junk line never matches at all.
    assert_eq!(extents.len(), 1);
    assert_eq!(extents[0].0, PhysAddr::new(0x8000_0000));
    assert_eq!(extents[0].1, PhysAddr::new(0x8000_0fff));
}

#[test]
fn test_script_manifest_four_column_lines()
{
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("EBI1CS0.BIN"), vec![0xcc; 1024]).unwrap();
    std::fs::write(
        dir.path().join("load.cmm"),
        "data.load.binary EBI1CS0.BIN 0x80000000 /noclear\nprint done\n",
    )
    .unwrap();

    let image = manifest::load_dump_directory(dir.path()).unwrap();
    assert_eq!(image.extents().len(), 1);
    assert_eq!(image.extents()[0].2, "EBI1CS0");
}

#[test]
fn test_no_usable_segments_is_fatal()
{
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("dump_info.txt"), "nothing here\n").unwrap();

    let err = manifest::load_dump_directory(dir.path()).unwrap_err();
    assert!(matches!(err, AnalysisError::NoSegments(_)));
}

#[test]
fn test_segment_read_scenario_from_offset()
{
    // The canonical two-segment scenario: DDR1 and DDR2 over distinct
    // ranges, byte-precise read inside DDR1, hole above both.
    let dir = TempDir::new().unwrap();
    let mut ddr1 = vec![0u8; 0x40];
    ddr1[0x10..0x14].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    let path1 = dir.path().join("DDR1.BIN");
    std::fs::write(&path1, &ddr1).unwrap();
    let path2 = dir.path().join("DDR2.BIN");
    std::fs::write(&path2, vec![0u8; 0x40]).unwrap();

    let image = MemoryImage::new(vec![
        MemorySegment::new(path1, 0x8000_0000, 0x8fff_ffff, "DDR1".to_string()),
        MemorySegment::new(path2, 0x9000_0000, 0x9fff_ffff, "DDR2".to_string()),
    ]);

    assert_eq!(
        image.read_physical(PhysAddr::new(0x8000_0010), 4).unwrap(),
        vec![0xde, 0xad, 0xbe, 0xef]
    );
    assert!(image.read_physical(PhysAddr::new(0xa000_0000), 4).is_none());
}
