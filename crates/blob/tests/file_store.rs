use bsvd_blob::{BlobError, BlobStore, FileBlobStore, FileType};

#[test]
fn file_store_roundtrip_and_idempotence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileBlobStore::new(dir.path()).expect("open");
    let key = [0x42u8; 32];

    store.put(&key, FileType::Tx, b"extended tx bytes").expect("put");
    assert!(matches!(
        store.put(&key, FileType::Tx, b"extended tx bytes"),
        Err(BlobError::AlreadyExists)
    ));
    assert_eq!(
        store.get(&key, FileType::Tx).expect("get"),
        Some(b"extended tx bytes".to_vec())
    );
    assert!(store.exists(&key, FileType::Tx).expect("exists"));
    assert_eq!(store.get(&key, FileType::Outputs).expect("get"), None);

    store.delete(&key, FileType::Tx).expect("delete");
    assert!(!store.exists(&key, FileType::Tx).expect("exists"));
    // Deleting a missing blob is a no-op.
    store.delete(&key, FileType::Tx).expect("delete");
}

#[test]
fn outputs_superseded_by_tx() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileBlobStore::new(dir.path()).expect("open");
    let key = [0x07u8; 32];

    // Partial transaction lands as an output set first.
    store.put(&key, FileType::Outputs, b"outputs").expect("put");
    // Later the full transaction arrives; both variants coexist during the
    // transition, then the output set is retired.
    store.put(&key, FileType::Tx, b"full tx").expect("put");
    assert!(store.exists(&key, FileType::Outputs).expect("exists"));
    assert!(store.exists(&key, FileType::Tx).expect("exists"));
    store.delete(&key, FileType::Outputs).expect("delete");
    assert_eq!(
        store.get(&key, FileType::Tx).expect("get"),
        Some(b"full tx".to_vec())
    );
}
