//! Full RPC sessions between a store server task and a client, over real
//! socketpairs, the way the two child processes talk in production.

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use filedrop::{
    item::Item,
    rpc::{FdChannel, Handler, StoreClient, StoreServer},
    store::{IdGenerator, Store},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::io::AsyncReadExt;

struct Session {
    client: StoreClient,
    store: Arc<Store>,
    _dir: tempfile::TempDir,
    server: tokio::task::JoinHandle<()>,
}

async fn session() -> Session {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path(), IdGenerator::random(4), true).unwrap());

    let (rpc_server, rpc_client) = Handler::pair().unwrap();
    let (fd_server, fd_client) = FdChannel::pair().unwrap();

    let server_store = store.clone();
    let server = tokio::spawn(async move {
        let server = StoreServer::new(server_store, rpc_server, fd_server);
        let _ = server.run().await;
    });

    Session {
        client: StoreClient::new(rpc_client, fd_client, Duration::from_secs(3)),
        store,
        _dir: dir,
        server,
    }
}

fn item() -> Item {
    let created = Utc::now();

    Item {
        id: String::new(),
        deletion_key: "k3y".to_string(),
        burn_after_reading: false,
        filename: "hi.txt".to_string(),
        content_type: "text/plain".to_string(),
        created,
        expires: created + ChronoDuration::minutes(1),
        owners: HashMap::from([(
            filedrop::item::OwnerKind::RemotePeer,
            "127.0.0.1".parse().unwrap(),
        )]),
    }
}

async fn read_blob(client: &StoreClient, id: &str) -> Vec<u8> {
    let fd = client.get_file(id).await.unwrap();
    let mut blob = tokio::fs::File::from_std(fd.into_file());

    let mut contents = Vec::new();
    blob.read_to_end(&mut contents).await.unwrap();
    contents
}

#[tokio::test(flavor = "multi_thread")]
async fn get_missing_id() {
    let session = session().await;

    let fault = session.client.get("whatever").await.unwrap_err();
    assert!(fault.is_not_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn put_then_get_round_trips() {
    let session = session().await;

    let mut expected = item();
    let id = session
        .client
        .put(&expected, Bytes::from_static(b"hello world"))
        .await
        .unwrap();
    expected.id = id.clone();

    let fetched = session.client.get(&id).await.unwrap();
    assert_eq!(fetched, expected);

    assert_eq!(read_blob(&session.client, &id).await, b"hello world");
}

#[tokio::test(flavor = "multi_thread")]
async fn put_bodies_of_many_sizes() {
    let session = session().await;

    for size in [1usize, 128, 1024, 64 * 1024, 1024 * 1024] {
        let body: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

        let id = session
            .client
            .put(&item(), Bytes::from(body.clone()))
            .await
            .unwrap();

        assert_eq!(read_blob(&session.client, &id).await, body, "size {}", size);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn ids_differ_between_puts() {
    let session = session().await;

    let a = session
        .client
        .put(&item(), Bytes::from_static(b"a"))
        .await
        .unwrap();
    let b = session
        .client
        .put(&item(), Bytes::from_static(b"b"))
        .await
        .unwrap();

    assert_ne!(a, b);
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_is_idempotent() {
    let session = session().await;

    let id = session
        .client
        .put(&item(), Bytes::from_static(b"bye"))
        .await
        .unwrap();

    session.client.delete(&id).await.unwrap();

    assert!(session.client.get(&id).await.unwrap_err().is_not_found());
    assert!(session
        .client
        .get_file(&id)
        .await
        .unwrap_err()
        .is_not_found());

    // a second deletion is not an error
    session.client.delete(&id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_item_vanishes() {
    let session = session().await;

    let mut stale = item();
    stale.expires = Utc::now() - ChronoDuration::minutes(1);

    let id = session
        .client
        .put(&stale, Bytes::from_static(b"stale"))
        .await
        .unwrap();

    let fault = session.client.get(&id).await.unwrap_err();
    assert!(fault.is_not_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn server_shuts_down_with_the_client() {
    let session = session().await;

    drop(session.client);

    tokio::time::timeout(Duration::from_secs(1), session.server)
        .await
        .expect("server noticed the hangup")
        .unwrap();

    session.store.close().await;
}
