#![allow(clippy::unwrap_used, missing_docs)]

use bytes::Bytes;
use futures::StreamExt as _;

use aggfs::error::VfsError;
use aggfs::plugin::{Plugin, PluginHandle as _};
use aggfs::plugins::memfs::MemFs;
use aggfs::types::{FileKind, OpenFlag, WriteFlag};

#[tokio::test]
async fn create_write_read() {
    let fs = MemFs::new("mem");
    fs.create("/f.txt").await.unwrap();
    fs.write("/f.txt", Bytes::from_static(b"hello"), 0, WriteFlag::empty())
        .await
        .unwrap();

    assert_eq!(&fs.read("/f.txt", 0, -1).await.unwrap()[..], b"hello");
    assert_eq!(&fs.read("/f.txt", 1, 3).await.unwrap()[..], b"ell");
}

#[tokio::test]
async fn create_fails_on_existing() {
    let fs = MemFs::new("mem");
    fs.create("/f").await.unwrap();
    assert!(matches!(
        fs.create("/f").await.unwrap_err(),
        VfsError::AlreadyExists(_)
    ));
}

#[tokio::test]
async fn create_auto_creates_parent_directories() {
    let fs = MemFs::new("mem");
    fs.create("/a/b/c/file").await.unwrap();
    assert_eq!(fs.stat("/a").await.unwrap().kind, FileKind::Directory);
    assert_eq!(fs.stat("/a/b/c").await.unwrap().kind, FileKind::Directory);
}

#[tokio::test]
async fn write_without_create_on_missing_file_fails() {
    let fs = MemFs::new("mem");
    let err = fs
        .write("/missing", Bytes::from_static(b"x"), 0, WriteFlag::empty())
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::NotFound(_)));
}

#[tokio::test]
async fn append_ignores_offset() {
    let fs = MemFs::new("mem");
    fs.write("/f", Bytes::from_static(b"abc"), 0, WriteFlag::CREATE)
        .await
        .unwrap();
    fs.write("/f", Bytes::from_static(b"def"), 0, WriteFlag::APPEND)
        .await
        .unwrap();
    assert_eq!(&fs.read("/f", 0, -1).await.unwrap()[..], b"abcdef");
}

#[tokio::test]
async fn negative_offset_appends() {
    let fs = MemFs::new("mem");
    fs.write("/f", Bytes::from_static(b"abc"), 0, WriteFlag::CREATE)
        .await
        .unwrap();
    fs.write("/f", Bytes::from_static(b"xyz"), -1, WriteFlag::empty())
        .await
        .unwrap();
    assert_eq!(&fs.read("/f", 0, -1).await.unwrap()[..], b"abcxyz");
}

#[tokio::test]
async fn sparse_write_zero_fills_the_gap() {
    let fs = MemFs::new("mem");
    fs.write("/f", Bytes::from_static(b"ab"), 0, WriteFlag::CREATE)
        .await
        .unwrap();
    fs.write("/f", Bytes::from_static(b"z"), 5, WriteFlag::empty())
        .await
        .unwrap();
    assert_eq!(&fs.read("/f", 0, -1).await.unwrap()[..], b"ab\0\0\0z");
}

#[tokio::test]
async fn truncate_zero_pads_and_shrinks() {
    let fs = MemFs::new("mem");
    fs.write("/f", Bytes::from_static(b"hello"), 0, WriteFlag::CREATE)
        .await
        .unwrap();

    fs.truncate("/f", 8).await.unwrap();
    assert_eq!(&fs.read("/f", 0, -1).await.unwrap()[..], b"hello\0\0\0");

    fs.truncate("/f", 2).await.unwrap();
    assert_eq!(&fs.read("/f", 0, -1).await.unwrap()[..], b"he");
}

#[tokio::test]
async fn mkdir_is_idempotent_on_directories_only() {
    let fs = MemFs::new("mem");
    fs.mkdir("/d", 0o755).await.unwrap();
    fs.mkdir("/d", 0o755).await.unwrap();

    fs.create("/f").await.unwrap();
    assert!(matches!(
        fs.mkdir("/f", 0o755).await.unwrap_err(),
        VfsError::AlreadyExists(_)
    ));
}

#[tokio::test]
async fn remove_refuses_nonempty_directories() {
    let fs = MemFs::new("mem");
    fs.create("/d/f").await.unwrap();

    assert!(fs.remove("/d").await.is_err());
    fs.remove("/d/f").await.unwrap();
    fs.remove("/d").await.unwrap();
    assert!(fs.stat("/d").await.is_err());
}

#[tokio::test]
async fn remove_all_removes_subtree() {
    let fs = MemFs::new("mem");
    fs.create("/d/a").await.unwrap();
    fs.create("/d/sub/b").await.unwrap();

    fs.remove_all("/d").await.unwrap();
    assert!(fs.stat("/d").await.is_err());
    assert!(fs.stat("/d/sub/b").await.is_err());
}

#[tokio::test]
async fn rename_moves_directories_with_children() {
    let fs = MemFs::new("mem");
    fs.create("/old/a").await.unwrap();
    fs.create("/old/sub/b").await.unwrap();

    fs.rename("/old", "/new").await.unwrap();
    assert!(fs.stat("/old").await.is_err());
    assert_eq!(fs.stat("/new").await.unwrap().kind, FileKind::Directory);
    assert!(fs.stat("/new/a").await.is_ok());
    assert!(fs.stat("/new/sub/b").await.is_ok());
}

#[tokio::test]
async fn chmod_updates_mode() {
    let fs = MemFs::new("mem");
    fs.create("/f").await.unwrap();
    fs.chmod("/f", 0o600).await.unwrap();
    assert_eq!(fs.stat("/f").await.unwrap().mode, 0o600);
}

#[tokio::test]
async fn readdir_lists_direct_children_only() {
    let fs = MemFs::new("mem");
    fs.create("/top").await.unwrap();
    fs.create("/d/inner").await.unwrap();

    let mut names: Vec<String> = fs
        .readdir("/")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["d", "top"]);

    assert!(matches!(
        fs.readdir("/top").await.unwrap_err(),
        VfsError::NotADirectory(_)
    ));
}

#[tokio::test]
async fn handle_write_then_read() {
    let fs = MemFs::new("mem");
    let handle = fs
        .open_handle(
            "/f",
            OpenFlag::READ | OpenFlag::WRITE | OpenFlag::CREATE,
            0o644,
        )
        .await
        .unwrap();

    handle
        .write_at(Bytes::from_static(b"stateful"), 0)
        .await
        .unwrap();
    assert_eq!(&handle.read_at(0, -1).await.unwrap()[..], b"stateful");
    assert_eq!(&handle.read_at(2, 3).await.unwrap()[..], b"ate");
    handle.close().await.unwrap();

    // Data persists past the handle.
    assert_eq!(&fs.read("/f", 0, -1).await.unwrap()[..], b"stateful");
}

#[tokio::test]
async fn exclusive_open_handle_fails_on_existing() {
    let fs = MemFs::new("mem");
    fs.create("/f").await.unwrap();
    let err = fs
        .open_handle("/f", OpenFlag::WRITE | OpenFlag::EXCLUSIVE, 0o644)
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::AlreadyExists(_)));
}

#[tokio::test]
async fn open_stream_yields_whole_content() {
    let fs = MemFs::new("mem");
    let payload = vec![7u8; 100_000];
    fs.write("/big", Bytes::from(payload.clone()), 0, WriteFlag::CREATE)
        .await
        .unwrap();

    let mut stream = fs.open_stream("/big").await.unwrap();
    let mut collected = Vec::new();
    let mut chunks = 0;
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
        chunks += 1;
    }
    assert_eq!(collected, payload);
    assert!(chunks > 1, "large content arrives in multiple chunks");
}
