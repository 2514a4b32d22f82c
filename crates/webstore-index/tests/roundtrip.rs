use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use webstore_index::{
    DiskFiles, Identity, IndexConfig, IterFilter, IterOrder, StorageObjectIndex,
};
use webstore_policy::{QuotaPolicy, StorageClass};

fn open_index(root: &std::path::Path) -> StorageObjectIndex {
    let index = StorageObjectIndex::new(
        IndexConfig::default(),
        Arc::new(QuotaPolicy::new()),
        Arc::new(DiskFiles),
    );
    index.add_context(0, root).unwrap();
    index
}

type Snapshot = BTreeMap<(String, String, Option<String>), (Option<String>, PathBuf)>;

fn snapshot(index: &StorageObjectIndex) -> Snapshot {
    index
        .iter(0, IterOrder::Ascending, IterFilter::default())
        .map(|entry| {
            let entry = entry.unwrap();
            let identity = entry.identity().clone();
            (
                (
                    identity.class.to_string(),
                    identity.origin,
                    identity.name,
                ),
                (
                    entry.version().map(str::to_string),
                    entry
                        .data_file()
                        .and_then(|f| f.relative_path())
                        .map(PathBuf::from)
                        .unwrap_or_default(),
                ),
            )
        })
        .collect()
}

#[test]
fn test_index_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(dir.path());

    for i in 0..40 {
        let class = if i % 2 == 0 {
            StorageClass::WebDatabase
        } else {
            StorageClass::LocalStorage
        };
        let name = (class == StorageClass::WebDatabase).then(|| format!("db{i}"));
        let origin = format!("https://site{i}.example");
        let id = index
            .lookup_or_create(Identity::new(0, class, origin, name))
            .unwrap();
        index.ensure_data_file(id).unwrap();
        if i % 3 == 0 {
            index.set_version(id, Some(format!("{i}.0"))).unwrap();
        }
    }
    // Neither of these belongs in the file.
    let memory = index
        .lookup_or_create(
            Identity::new(0, StorageClass::WebDatabase, "https://memory.example", None)
                .memory_only(),
        )
        .unwrap();
    index.ensure_data_file(memory).unwrap();
    index
        .lookup_or_create(Identity::new(
            0,
            StorageClass::LocalStorage,
            "https://nofile.example",
            None,
        ))
        .unwrap();

    let before = snapshot(&index);
    assert!(index.flush(0).unwrap());
    drop(index);

    let reloaded = open_index(dir.path());
    let after = snapshot(&reloaded);
    assert_eq!(after.len(), 40);
    let expected: Snapshot = before
        .into_iter()
        .filter(|((_, origin, _), _)| {
            origin != "https://memory.example" && origin != "https://nofile.example"
        })
        .collect();
    assert_eq!(after, expected);

    // Serials continue after the highest one read back.
    let fresh = reloaded
        .lookup_or_create(Identity::new(
            0,
            StorageClass::WebDatabase,
            "https://site0.example",
            Some("new".into()),
        ))
        .unwrap();
    let handle = reloaded.ensure_data_file(fresh).unwrap();
    let taken: Vec<PathBuf> = after.values().map(|(_, path)| path.clone()).collect();
    assert!(!taken.contains(&handle.relative_path().unwrap().to_path_buf()));
}

#[test]
fn test_skipped_origins_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(dir.path());
    for origin in ["opera:blank", "https://kept.example"] {
        let id = index
            .lookup_or_create(Identity::new(0, StorageClass::LocalStorage, origin, None))
            .unwrap();
        index.ensure_data_file(id).unwrap();
    }
    index.flush(0).unwrap();
    drop(index);

    let reloaded = open_index(dir.path());
    let origins: Vec<String> = reloaded
        .iter(0, IterOrder::Unordered, IterFilter::default())
        .map(|e| e.unwrap().origin().to_string())
        .collect();
    assert_eq!(origins, vec!["https://kept.example"]);
    assert!(reloaded.is_dirty(0));
}

#[test]
fn test_deleted_entries_are_not_written() {
    let dir = tempfile::tempdir().unwrap();
    let index = open_index(dir.path());
    let identity = Identity::new(0, StorageClass::WebDatabase, "https://gone.example", Some("db".into()));
    let id = index.lookup_or_create(identity.clone()).unwrap();
    index.ensure_data_file(id).unwrap();
    index.flush(0).unwrap();

    index.delete(&identity).unwrap();
    index.release(id).unwrap();
    index.flush(0).unwrap();
    assert!(index.entry(id).is_none());
    drop(index);

    let reloaded = open_index(dir.path());
    assert!(reloaded.find(&identity).is_none());
}
