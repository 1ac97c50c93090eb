use serde_json::json;
use storagecrypt_core::{
    Account, AppCredentials, DriveStorage, Reason, RemoteChange, RemoteStorage, StorageType,
    no_progress,
};
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn storage(server: &MockServer) -> DriveStorage {
    let credentials = AppCredentials {
        client_id: "client".into(),
        client_secret: "secret".into(),
        redirect_uri: "http://localhost/cb".into(),
        scope: None,
    };
    DriveStorage::with_base_url(&server.uri(), credentials)
        .unwrap()
        .with_page_size(2)
}

fn account() -> Account {
    let mut account = Account::new(StorageType::Drive, "me@example.com").with_access_token("tok");
    account.root_folder_id = Some("root-id".into());
    account
}

fn file(id: &str, name: &str, parent: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "mimeType": "text/plain",
        "parents": [parent],
        "size": "4",
        "version": "7",
        "modifiedTime": "2024-01-01T00:00:00Z"
    })
}

#[tokio::test]
async fn child_documents_follow_page_tokens() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/root-id"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "root-id",
            "name": "StorageCrypt",
            "mimeType": "application/vnd.google-apps.folder",
            "parents": ["root"]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [file("a", "a.txt", "root-id"), file("b", "b.txt", "root-id")],
            "nextPageToken": "p2"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("pageToken", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [file("c", "c.txt", "root-id")]
        })))
        .mount(&server)
        .await;

    let drive = storage(&server);
    let root = drive.root_folder(&account()).await.unwrap();
    assert!(root.entry().is_folder);

    let children = root.child_documents(&no_progress()).await.unwrap();
    let names: Vec<_> = children.iter().map(|c| c.entry().name.clone()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
    assert_eq!(children[0].entry().version, Some(7));
    assert_eq!(children[0].entry().size, Some(4));
}

#[tokio::test]
async fn delta_keeps_app_folder_descendants_and_drops_moved_files() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/changes"))
        .and(query_param("pageToken", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [
                { "fileId": "a", "removed": false, "file": file("a", "a.txt", "root-id") },
                { "fileId": "sub", "removed": false, "file": {
                    "id": "sub", "name": "sub", "mimeType": "application/vnd.google-apps.folder",
                    "parents": ["root-id"]
                }},
                { "fileId": "b", "removed": false, "file": file("b", "b.txt", "sub") }
            ],
            "nextPageToken": "11"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/changes"))
        .and(query_param("pageToken", "11"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [
                { "fileId": "c", "removed": false, "file": file("c", "c.txt", "known") },
                { "fileId": "x", "removed": false, "file": file("x", "x.txt", "elsewhere") },
                { "fileId": "gone", "removed": true }
            ],
            "newStartPageToken": "12"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/known"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "known", "parents": ["root-id"]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/elsewhere"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "elsewhere", "parents": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let drive = storage(&server);
    let changes = drive
        .changes(&account(), Some("10"), &no_progress())
        .await
        .unwrap();

    let ids: Vec<_> = changes.changes.iter().map(|c| c.id().to_string()).collect();
    assert_eq!(ids, vec!["a", "sub", "b", "c", "x", "gone"]);
    assert!(matches!(changes.changes[3], RemoteChange::Modification(_)));
    // x now lives outside the app folder.
    assert!(matches!(changes.changes[4], RemoteChange::Deletion { .. }));
    assert!(matches!(changes.changes[5], RemoteChange::Deletion { .. }));
    assert_eq!(changes.cursor.as_deref(), Some("12"));
    assert!(changes.scanned_ids.is_none());
}

#[tokio::test]
async fn initial_changes_capture_start_token_then_scan() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/changes/startPageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "startPageToken": "99" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/root-id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "root-id",
            "name": "StorageCrypt",
            "mimeType": "application/vnd.google-apps.folder"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [file("a", "a.txt", "root-id")]
        })))
        .mount(&server)
        .await;

    let drive = storage(&server);
    let changes = drive.changes(&account(), None, &no_progress()).await.unwrap();

    assert_eq!(changes.cursor.as_deref(), Some("99"));
    assert_eq!(changes.changes.len(), 1);
    assert!(changes.scanned_ids.unwrap().contains("a"));
}

#[tokio::test]
async fn rate_limited_forbidden_maps_to_too_many_requests() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/a"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "errors": [{ "reason": "rateLimitExceeded" }], "code": 403 }
        })))
        .mount(&server)
        .await;

    let drive = storage(&server);
    let err = drive
        .document(&account(), "a")
        .await
        .err()
        .expect("expected failure");

    assert_eq!(err.reason(), Reason::TooManyRequests);
}

#[tokio::test]
async fn deleting_missing_file_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/drive/v3/files/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let drive = storage(&server);
    drive.delete_file(&account(), "gone").await.unwrap();
}

#[tokio::test]
async fn upload_data_patches_media_and_refreshes_entry() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/f1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(file("f1", "f.txt", "root-id")))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/upload/drive/v3/files/f1"))
        .and(query_param("uploadType", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "f1",
            "name": "f.txt",
            "mimeType": "text/plain",
            "parents": ["root-id"],
            "size": "5",
            "version": "8"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let drive = storage(&server);
    let mut document = drive.document(&account(), "f1").await.unwrap();
    let entry = document
        .upload_data(b"hello".to_vec(), &no_progress())
        .await
        .unwrap();

    assert_eq!(entry.version, Some(8));
    assert_eq!(document.entry().size, Some(5));
}
