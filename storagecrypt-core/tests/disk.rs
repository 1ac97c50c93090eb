use std::time::Duration;

use serde_json::json;
use storagecrypt_core::{
    Account, AppCredentials, DiskStorage, RemoteChange, RemoteStorage, StorageType, no_progress,
};
use tempfile::tempdir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn storage(server: &MockServer) -> DiskStorage {
    let credentials = AppCredentials {
        client_id: "client".into(),
        client_secret: "secret".into(),
        redirect_uri: "http://localhost/cb".into(),
        scope: None,
    };
    DiskStorage::with_base_url(&server.uri(), credentials)
        .unwrap()
        .with_page_size(2)
        .with_poll_interval(Duration::from_millis(5))
}

fn account() -> Account {
    Account::new(StorageType::Disk, "me").with_access_token("test-token")
}

fn resource(path: &str, name: &str, kind: &str, modified: &str) -> serde_json::Value {
    json!({
        "path": path,
        "name": name,
        "type": kind,
        "size": 3,
        "modified": modified
    })
}

async fn mount_root(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1/disk/resources"))
        .and(query_param("path", "app:/"))
        .and(query_param("limit", "0"))
        .and(header("authorization", "OAuth test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(resource(
            "app:/",
            "app",
            "dir",
            "2024-01-01T00:00:00Z",
        )))
        .mount(server)
        .await;
}

async fn mount_tree(server: &MockServer) {
    mount_root(server).await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/resources"))
        .and(query_param("path", "app:/"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "app:/", "name": "app", "type": "dir",
            "_embedded": { "total": 3, "items": [
                resource("app:/a.txt", "a.txt", "file", "1970-01-01T00:00:01Z"),
                resource("app:/Docs", "Docs", "dir", "1970-01-01T00:00:02Z")
            ]}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/resources"))
        .and(query_param("path", "app:/"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "app:/", "name": "app", "type": "dir",
            "_embedded": { "total": 3, "items": [
                resource("app:/b.txt", "b.txt", "file", "1970-01-01T00:00:05Z")
            ]}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/resources"))
        .and(query_param("path", "app:/Docs"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "app:/Docs", "name": "Docs", "type": "dir",
            "_embedded": { "total": 1, "items": [
                resource("app:/Docs/c.txt", "c.txt", "file", "1970-01-01T00:00:04Z")
            ]}
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn full_scan_walks_folders_with_offsets() {
    let server = MockServer::start().await;
    mount_tree(&server).await;

    let disk = storage(&server);
    let changes = disk.changes(&account(), None, &no_progress()).await.unwrap();

    let ids: Vec<_> = changes.changes.iter().map(|c| c.id().to_string()).collect();
    assert_eq!(ids, vec!["app:/a.txt", "app:/Docs", "app:/b.txt", "app:/Docs/c.txt"]);
    assert_eq!(changes.cursor.as_deref(), Some("5000"));
    match &changes.changes[3] {
        RemoteChange::Modification(entry) => {
            assert_eq!(entry.parent_id.as_deref(), Some("app:/Docs"));
        }
        other => panic!("unexpected change {other:?}"),
    }
}

#[tokio::test]
async fn rescan_reports_only_entries_newer_than_the_cursor() {
    let server = MockServer::start().await;
    mount_tree(&server).await;

    let disk = storage(&server);
    let changes = disk
        .changes(&account(), Some("3000"), &no_progress())
        .await
        .unwrap();

    let ids: Vec<_> = changes.changes.iter().map(|c| c.id().to_string()).collect();
    assert_eq!(ids, vec!["app:/Docs", "app:/b.txt", "app:/Docs/c.txt"]);
    assert_eq!(changes.cursor.as_deref(), Some("5000"));
    assert_eq!(changes.scanned_ids.unwrap().len(), 4);
}

#[tokio::test]
async fn rescan_keeps_a_cursor_newer_than_every_entry() {
    let server = MockServer::start().await;
    mount_tree(&server).await;

    let disk = storage(&server);
    let changes = disk
        .changes(&account(), Some("9000"), &no_progress())
        .await
        .unwrap();

    assert!(changes.changes.is_empty());
    assert_eq!(changes.cursor.as_deref(), Some("9000"));
    assert!(changes.scanned_ids.unwrap().contains("app:/a.txt"));
}

#[tokio::test]
async fn async_delete_is_polled_to_completion() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/disk/resources"))
        .and(query_param("path", "app:/Docs"))
        .and(query_param("permanently", "true"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "href": format!("{}/v1/disk/operations/op-1", server.uri()),
            "method": "GET",
            "templated": false
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/operations/op-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "success" })))
        .expect(1)
        .mount(&server)
        .await;

    let disk = storage(&server);
    disk.delete_folder(&account(), "app:/Docs").await.unwrap();
}

#[tokio::test]
async fn deleting_absent_path_is_success() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/disk/resources"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": "DiskNotFoundError"
        })))
        .mount(&server)
        .await;

    let disk = storage(&server);
    disk.delete_file(&account(), "app:/gone.txt").await.unwrap();
}

#[tokio::test]
async fn upload_and_download_go_through_links() {
    let server = MockServer::start().await;
    mount_root(&server).await;

    Mock::given(method("GET"))
        .and(path("/v1/disk/resources/upload"))
        .and(query_param("path", "app:/new.bin"))
        .and(query_param("overwrite", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "href": format!("{}/upload-target", server.uri()),
            "method": "PUT"
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload-target"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/resources"))
        .and(query_param("path", "app:/new.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "app:/new.bin",
            "name": "new.bin",
            "type": "file",
            "size": 3,
            "revision": 1700000000000000i64,
            "md5": "acbd18db4cc2f85cedef654fccc4a4d8",
            "modified": "2024-01-01T00:00:00Z"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/resources/download"))
        .and(query_param("path", "app:/new.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "href": format!("{}/download-target", server.uri()),
            "method": "GET"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/download-target"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"foo".to_vec()))
        .mount(&server)
        .await;

    let disk = storage(&server);
    let root = disk.root_folder(&account()).await.unwrap();
    let listener = no_progress();
    let uploaded = root
        .upload_new_child_data("new.bin", "application/octet-stream", b"foo".to_vec(), &listener)
        .await
        .unwrap();
    assert_eq!(uploaded.entry().version, Some(1_700_000_000_000_000));

    let dir = tempdir().unwrap();
    let target = dir.path().join("new.bin");
    uploaded.download_file(&target, &listener).await.unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), b"foo");
}
