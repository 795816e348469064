//! Disk image format and lookup table properties

mod common;

use common::{init_logging, scenario_disk};
use icc_target::disk::build::{name16, FileAttrs, Node, NodeKind};
use icc_target::disk::{Disk, MAGIC_LEN};
use icc_target::fs::{Aid, Endianness, Lcs};

/// A deeper disk: MF with a nested DF, several EFs, and two ADF trees
fn layered_disk(endian: Endianness) -> Disk {
    let mf = Node {
        attrs: FileAttrs::new(0x3F00, 0),
        kind: NodeKind::Mf {
            name: name16("mf"),
            children: vec![
                Node {
                    attrs: FileAttrs::new(0x2F00, 0x01),
                    kind: NodeKind::EfTransparent {
                        data: vec![0xDE, 0xAD],
                    },
                },
                Node {
                    attrs: FileAttrs {
                        id: 0x7F20,
                        sid: 0,
                        lcs: Lcs::OperDeactivated,
                    },
                    kind: NodeKind::Df {
                        name: name16("telecom"),
                        children: vec![
                            Node {
                                attrs: FileAttrs::new(0x6F05, 0x05),
                                kind: NodeKind::EfLinearFixed {
                                    rcrd_size: 3,
                                    data: vec![1, 2, 3, 4, 5, 6],
                                },
                            },
                            Node {
                                attrs: FileAttrs::new(0x6F06, 0x06),
                                kind: NodeKind::EfCyclic {
                                    rcrd_size: 2,
                                    data: vec![9, 9, 8, 8],
                                },
                            },
                        ],
                    },
                },
            ],
        },
    };
    let adf = |id: u16, rid_tail: u8| Node {
        attrs: FileAttrs::new(id, 0),
        kind: NodeKind::Adf {
            aid: Aid {
                rid: [0xA0, 0, 0, 0, rid_tail],
                pix: [0; 11],
            },
            children: vec![Node {
                attrs: FileAttrs::new(id + 1, 0x02),
                kind: NodeKind::EfTransparent { data: vec![id as u8] },
            }],
        },
    };
    Disk::from_tree_bufs(
        vec![
            mf.to_tree_bytes(endian),
            adf(0x7F10, 0x10).to_tree_bytes(endian),
            adf(0x7F12, 0x12).to_tree_bytes(endian),
        ],
        endian,
    )
    .unwrap()
}

#[test]
fn test_save_load_roundtrip() {
    init_logging();
    let disk = layered_disk(Endianness::native());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("layered.fs");
    disk.save(&path).unwrap();

    let loaded = Disk::load(&path).unwrap();
    assert_eq!(loaded.tree_count(), 3);
    for idx in 0..3u8 {
        assert_eq!(
            disk.tree(idx).unwrap().as_bytes(),
            loaded.tree(idx).unwrap().as_bytes()
        );
    }
}

#[test]
fn test_magic_stamps_endianness() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    for endian in [Endianness::Little, Endianness::Big] {
        let disk = layered_disk(endian);
        let path = dir.path().join(format!("disk-{endian:?}.fs"));
        disk.save(&path).unwrap();

        let raw = std::fs::read(&path).unwrap();
        let tail = &raw[MAGIC_LEN - 2..MAGIC_LEN];
        match endian {
            Endianness::Little => assert_eq!(tail, &[0xF0, 0x0F]),
            Endianness::Big => assert_eq!(tail, &[0x0F, 0xF0]),
        }

        // Loading honors the stamp regardless of host order
        let loaded = Disk::load(&path).unwrap();
        let (_, file) = loaded.lookup_by_id(0x6F05).unwrap();
        assert_eq!(file.id, 0x6F05);
        assert_eq!(file.rcrd_size(), Some(3));
    }
}

#[test]
fn test_id_lut_resolves_every_file() {
    init_logging();
    let disk = layered_disk(Endianness::native());
    for id in [0x3F00u16, 0x2F00, 0x7F20, 0x6F05, 0x6F06, 0x7F10, 0x7F11, 0x7F12, 0x7F13] {
        let (_, file) = disk.lookup_by_id(id).unwrap();
        assert_eq!(file.id, id);
    }
    assert!(disk.lutid().keys().windows(2).all(|w| w[0] < w[1]));
    assert_eq!(disk.lutid().len(), 9);
}

#[test]
fn test_sid_lut_is_rebuilt_per_tree() {
    init_logging();
    let disk = layered_disk(Endianness::native());
    let tree = disk.tree(0).unwrap();
    assert_eq!(tree.lookup_by_sid(0x01).unwrap().id, 0x2F00);
    assert_eq!(tree.lookup_by_sid(0x05).unwrap().id, 0x6F05);
    assert_eq!(tree.lookup_by_sid(0x06).unwrap().id, 0x6F06);
    // SID 0x02 belongs to the ADF trees, not the MF tree
    assert!(tree.lookup_by_sid(0x02).is_err());
    assert_eq!(disk.tree(1).unwrap().lookup_by_sid(0x02).unwrap().id, 0x7F11);
}

#[test]
fn test_nested_df_records_and_lcs() {
    init_logging();
    let disk = layered_disk(Endianness::native());
    let (tree_idx, df) = disk.lookup_by_id(0x7F20).unwrap();
    assert_eq!(tree_idx, 0);
    assert_eq!(df.item.lcs, Lcs::OperDeactivated);
    assert!(df.is_folder());

    let tree = disk.tree(0).unwrap();
    let (_, cyclic) = disk.lookup_by_id(0x6F06).unwrap();
    assert_eq!(tree.record_count(&cyclic).unwrap(), 2);
    assert_eq!(tree.record(&cyclic, 1).unwrap(), &[8, 8]);

    // The cyclic EF's parent is the nested DF, whose parent is the MF
    let parent = tree.parent_of(&cyclic).unwrap();
    assert_eq!(parent.id, 0x7F20);
    assert_eq!(tree.parent_of(&parent).unwrap().id, 0x3F00);
}

#[test]
fn test_trailing_garbage_rejected() {
    init_logging();
    let disk = scenario_disk();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.fs");
    disk.save(&path).unwrap();

    let mut raw = std::fs::read(&path).unwrap();
    raw.extend_from_slice(&[0x00; 4]);
    std::fs::write(&path, raw).unwrap();
    assert!(Disk::load(&path).is_err());
}
