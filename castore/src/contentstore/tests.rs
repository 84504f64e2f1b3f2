//! This contains test scenarios that a given [ContentStore] and its
//! [ImageService] need to pass.
//! We use [rstest] and [rstest_reuse] to provide all stores we want to test
//! against, and then apply this template to all test functions.

use std::sync::Arc;
use std::time::SystemTime;

use rstest::*;
use rstest_reuse::{self, *};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{from_addr, ContentStore, Image, ImageService};
use crate::fixtures::{blob_a_descriptor, blob_b_descriptor, BLOB_A, BLOB_A_DIGEST, BLOB_B};
use crate::oci::ref_key;

type Stores = (Arc<dyn ContentStore>, Arc<dyn ImageService>);

/// Constructs an fs store in a fresh temporary directory, which is kept
/// around after the test.
async fn make_fs_stores() -> Stores {
    let root = tempfile::TempDir::new().unwrap().into_path();
    from_addr(&format!("fs://{}", root.to_str().unwrap()))
        .await
        .unwrap()
}

#[template]
#[rstest]
#[case::memory(from_addr("memory://").await.unwrap())]
#[case::fs(make_fs_stores().await)]
pub fn stores(#[case] stores: Stores) {}

/// Trying to get info for a blob the store doesn't have returns None.
#[apply(stores)]
#[tokio::test]
async fn info_nonexistent(stores: Stores) {
    let (store, _) = stores;
    assert!(store
        .info(&BLOB_A_DIGEST)
        .await
        .expect("must not fail")
        .is_none());
    assert!(store
        .open_read(&BLOB_A_DIGEST)
        .await
        .expect("must not fail")
        .is_none());
}

/// Write a blob, observe its status while writing, commit it, read it back.
#[apply(stores)]
#[tokio::test]
async fn write_status_commit_read(stores: Stores) {
    let (store, _) = stores;
    let desc = blob_b_descriptor();
    let key = ref_key(&desc);
    let before = SystemTime::now();

    let mut w = store.writer(&key, &desc).await.expect("must open");
    w.write_all(&BLOB_B[..1024]).await.expect("must write");

    let statuses = store.list_statuses().await.expect("must list");
    assert_eq!(1, statuses.len());
    assert_eq!(key, statuses[0].ref_key);
    assert_eq!(1024, statuses[0].offset);
    assert_eq!(BLOB_B.len() as u64, statuses[0].total);

    w.write_all(&BLOB_B[1024..]).await.expect("must write");
    let info = w.commit().await.expect("must commit");
    assert_eq!(desc.digest, info.digest);
    assert_eq!(BLOB_B.len() as u64, info.size);

    assert!(store.list_statuses().await.unwrap().is_empty());

    let info = store
        .info(&desc.digest)
        .await
        .expect("must not fail")
        .expect("must exist");
    assert_eq!(BLOB_B.len() as u64, info.size);
    assert!(info.created_at >= before, "created before the write started");

    let mut buf = Vec::new();
    store
        .open_read(&desc.digest)
        .await
        .expect("must not fail")
        .expect("must exist")
        .read_to_end(&mut buf)
        .await
        .expect("must read");
    assert_eq!(&BLOB_B[..], &buf[..]);
}

/// Writing something that doesn't match the descriptor fails on commit, and
/// leaves nothing behind.
#[apply(stores)]
#[tokio::test]
async fn commit_wrong_content(stores: Stores) {
    let (store, _) = stores;
    let desc = blob_a_descriptor();

    // same size, other content
    let mut w = store.writer(&ref_key(&desc), &desc).await.unwrap();
    w.write_all(&[0xff, 0xff]).await.unwrap();
    w.commit().await.expect_err("must fail on digest mismatch");

    // other size
    let mut w = store.writer(&ref_key(&desc), &desc).await.unwrap();
    w.write_all(&[0x00]).await.unwrap();
    w.commit().await.expect_err("must fail on size mismatch");

    assert!(store.info(&desc.digest).await.unwrap().is_none());
    assert!(store.list_statuses().await.unwrap().is_empty());
}

/// Only one writer can be open for a given ref, and dropping it abandons the
/// write.
#[apply(stores)]
#[tokio::test]
async fn single_writer_per_ref(stores: Stores) {
    let (store, _) = stores;
    let desc = blob_a_descriptor();
    let key = ref_key(&desc);

    let w = store.writer(&key, &desc).await.expect("must open");
    assert!(store.writer(&key, &desc).await.is_err());

    drop(w);
    assert!(store.list_statuses().await.unwrap().is_empty());
    assert!(store.info(&desc.digest).await.unwrap().is_none());

    store.writer(&key, &desc).await.expect("must open again");
}

/// Committing a blob twice keeps the first copy and its creation time.
#[apply(stores)]
#[tokio::test]
async fn commit_existing(stores: Stores) {
    let (store, _) = stores;
    let desc = blob_a_descriptor();

    let mut w = store.writer(&ref_key(&desc), &desc).await.unwrap();
    w.write_all(&BLOB_A).await.unwrap();
    let first = w.commit().await.expect("must commit");

    let mut w = store.writer(&ref_key(&desc), &desc).await.unwrap();
    w.write_all(&BLOB_A).await.unwrap();
    let second = w.commit().await.expect("must commit");

    assert_eq!(first, second);
}

#[apply(stores)]
#[tokio::test]
async fn images_put_get_list(stores: Stores) {
    let (_, images) = stores;
    assert!(images.list().await.unwrap().is_empty());
    assert!(images.get("docker.io/library/x:1").await.unwrap().is_none());

    let x = Image {
        name: "docker.io/library/x:1".into(),
        target: blob_a_descriptor(),
    };
    let a = Image {
        name: "docker.io/library/a:1".into(),
        target: blob_b_descriptor(),
    };
    images.put(x.clone()).await.unwrap();
    images.put(a.clone()).await.unwrap();

    assert_eq!(vec![a.clone(), x.clone()], images.list().await.unwrap());

    // replacing keeps a single entry per name
    let x2 = Image {
        target: blob_b_descriptor(),
        ..x
    };
    images.put(x2.clone()).await.unwrap();
    assert_eq!(Some(x2.clone()), images.get(&x2.name).await.unwrap());
    assert_eq!(2, images.list().await.unwrap().len());
}
