use super::*;
use crate::accounts::StorageRegistry;
use crate::backoff::RateLimitPolicy;
use crate::crypto::{self, MemoryKeyStore, SecretKeys, ensure_keys};
use crate::paths::BlobStore;
use crate::testing::{FakeStorage, ROOT_ID};
use storagecrypt_core::{NoProgress, Reason, StorageType};
use tempfile::TempDir;

struct Harness {
    changes: Arc<ChangesSyncEngine>,
    documents: Arc<DocumentSyncEngine>,
    index: IndexStore,
    fake: FakeStorage,
    account: Account,
    keys: SecretKeys,
    control: SyncControl,
    _dir: TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let index = IndexStore::in_memory().await.unwrap();
    let fake = FakeStorage::new(StorageType::Drive);
    let mut registry = StorageRegistry::new();
    registry.register(Arc::new(fake.clone()));
    let account = index.insert_account(&fake.account("me")).await.unwrap();
    let accounts = Arc::new(AccountManager::new(
        index.clone(),
        registry,
        RateLimitPolicy::default(),
    ));
    let store = Arc::new(MemoryKeyStore::default());
    let keys = ensure_keys(store.as_ref(), "default").unwrap();
    let blobs = BlobStore::new(dir.path());
    blobs.ensure_dirs().await.unwrap();
    let events = EventBus::new();
    let control = SyncControl::new();
    let documents = Arc::new(DocumentSyncEngine::new(
        index.clone(),
        Arc::clone(&accounts),
        store,
        blobs,
        "default",
        events.clone(),
        control.clone(),
        3,
    ));
    let changes = Arc::new(
        ChangesSyncEngine::new(
            index.clone(),
            accounts,
            Arc::clone(&documents),
            events,
            control.clone(),
            3,
        )
        .with_retry_backoff(Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
            false,
        )),
    );
    Harness {
        changes,
        documents,
        index,
        fake,
        account,
        keys,
        control,
        _dir: dir,
    }
}

impl Harness {
    async fn row(&self, remote_id: &str) -> Option<EncryptedDocument> {
        self.index
            .get_document_by_back_entry(self.account.id, remote_id)
            .await
            .unwrap()
    }

    async fn cursor(&self) -> Option<String> {
        self.index
            .get_account(self.account.id)
            .await
            .unwrap()
            .unwrap()
            .last_remote_change_id
    }

    async fn account_state(&self) -> ChangesSyncState {
        self.index
            .get_account(self.account.id)
            .await
            .unwrap()
            .unwrap()
            .changes_sync_state
    }

    /// Marks the row's download as completed with a local copy.
    async fn settle_download(&self, id: i64) {
        self.index
            .update_sync_state(id, SyncAction::Download, SyncState::Running)
            .await
            .unwrap();
        self.index
            .update_sync_state(id, SyncAction::Download, SyncState::Done)
            .await
            .unwrap();
        self.index
            .update_local_file(id, Some(&BlobStore::blob_name_for(id)), Some(1), Some(1))
            .await
            .unwrap();
    }

    async fn seal(&self, plain: &[u8]) -> Vec<u8> {
        let mut sealed = Vec::new();
        crypto::encrypt(&self.keys, plain, &mut sealed, &NoProgress)
            .await
            .unwrap();
        sealed
    }
}

#[tokio::test]
async fn first_pass_scans_everything_and_stores_the_cursor() {
    let h = harness().await;
    h.fake.put_remote("f1", ROOT_ID, "photos", None);
    h.fake.put_remote("a", "f1", "a.jpg", Some(b"a"));
    h.fake.put_remote("b", ROOT_ID, "b.txt", Some(b"b"));

    let planned = h.changes.sync_changes(h.account.id).await.unwrap();
    assert_eq!(planned, 2);

    let folder = h.row("f1").await.unwrap();
    assert!(folder.is_folder);
    assert_eq!(folder.download_state, SyncState::Done);
    let a = h.row("a").await.unwrap();
    assert_eq!(a.parent_id, Some(folder.id));
    assert_eq!(a.download_state, SyncState::Planned);
    assert_eq!(a.back_entry_version, Some(1));
    assert_eq!(h.cursor().await.as_deref(), Some("3000"));

    h.fake.put_remote("c", "f1", "c.jpg", Some(b"c"));
    assert_eq!(h.changes.sync_changes(h.account.id).await.unwrap(), 1);
    assert_eq!(h.cursor().await.as_deref(), Some("4000"));
}

#[tokio::test]
async fn repeating_a_pass_without_remote_edits_plans_nothing() {
    let h = harness().await;
    h.fake.put_remote("a", ROOT_ID, "a.txt", Some(b"a"));
    h.changes.sync_changes(h.account.id).await.unwrap();
    let before = h.index.list_account_documents(h.account.id).await.unwrap();

    assert_eq!(h.changes.sync_changes(h.account.id).await.unwrap(), 0);
    assert_eq!(
        h.index.list_account_documents(h.account.id).await.unwrap(),
        before
    );
}

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let h = harness().await;
    h.index
        .update_last_remote_change_id(h.account.id, Some("90000"))
        .await
        .unwrap();
    h.fake.put_remote("a", ROOT_ID, "a.txt", Some(b"a"));

    h.changes.sync_changes(h.account.id).await.unwrap();
    assert_eq!(h.cursor().await.as_deref(), Some("90000"));
}

#[tokio::test]
async fn newer_remote_version_replans_the_download() {
    let h = harness().await;
    h.fake.put_remote("a", ROOT_ID, "a.txt", Some(b"one"));
    h.changes.sync_changes(h.account.id).await.unwrap();
    let row = h.row("a").await.unwrap();
    h.settle_download(row.id).await;

    h.fake.put_remote("a", ROOT_ID, "renamed.txt", Some(b"two"));
    assert_eq!(h.changes.sync_changes(h.account.id).await.unwrap(), 1);

    let row = h.row("a").await.unwrap();
    assert_eq!(row.display_name, "renamed.txt");
    assert_eq!(row.back_entry_version, Some(2));
    assert_eq!(row.download_state, SyncState::Planned);
}

#[tokio::test]
async fn pending_upload_is_not_overridden_by_a_remote_edit() {
    let h = harness().await;
    h.fake.put_remote("a", ROOT_ID, "a.txt", Some(b"one"));
    h.changes.sync_changes(h.account.id).await.unwrap();
    let row = h.row("a").await.unwrap();
    h.settle_download(row.id).await;
    h.index
        .update_sync_state(row.id, SyncAction::Upload, SyncState::Planned)
        .await
        .unwrap();

    h.fake.put_remote("a", ROOT_ID, "a.txt", Some(b"two"));
    assert_eq!(h.changes.sync_changes(h.account.id).await.unwrap(), 0);

    let row = h.row("a").await.unwrap();
    assert_eq!(row.back_entry_version, Some(1));
    assert_eq!(row.download_state, SyncState::Done);
    assert_eq!(row.upload_state, SyncState::Planned);
}

#[tokio::test]
async fn remote_deletion_plans_local_removal() {
    let h = harness().await;
    h.fake.put_remote("a", ROOT_ID, "a.txt", Some(b"a"));
    h.fake.put_remote("b", ROOT_ID, "b.txt", Some(b"b"));
    h.changes.sync_changes(h.account.id).await.unwrap();
    let a = h.row("a").await.unwrap();
    let b = h.row("b").await.unwrap();
    h.settle_download(a.id).await;

    h.fake.remove_remote("a");
    h.fake.remove_remote("b");
    assert_eq!(h.changes.sync_changes(h.account.id).await.unwrap(), 1);

    let a = h.index.require_document(a.id).await.unwrap();
    assert_eq!(a.deletion_state, SyncState::Planned);
    // Never downloaded, so nothing local is left to clean up.
    assert!(h.index.get_document(b.id).await.unwrap().is_none());
}

#[tokio::test]
async fn full_scan_detects_entries_that_disappeared() {
    let h = harness().await;
    h.fake.put_remote("a", ROOT_ID, "a.txt", Some(b"a"));
    h.changes.sync_changes(h.account.id).await.unwrap();
    let a = h.row("a").await.unwrap();
    h.settle_download(a.id).await;

    // Losing the cursor forces another full scan.
    h.fake.remove_remote("a");
    h.index
        .update_last_remote_change_id(h.account.id, None)
        .await
        .unwrap();
    assert_eq!(h.changes.sync_changes(h.account.id).await.unwrap(), 1);

    let a = h.index.require_document(a.id).await.unwrap();
    assert_eq!(a.deletion_state, SyncState::Planned);
}

#[tokio::test]
async fn children_listed_before_their_parent_are_attached_to_it() {
    let h = harness().await;
    h.fake.put_remote("f1", ROOT_ID, "outer", None);
    h.fake.put_remote("f2", "f1", "inner", None);
    h.fake.put_remote("a", "f2", "a.txt", Some(b"a"));
    // Touching the outer folder again moves it behind its children.
    h.fake.put_remote("f1", ROOT_ID, "outer", None);

    h.changes.sync_changes(h.account.id).await.unwrap();

    let outer = h.row("f1").await.unwrap();
    let inner = h.row("f2").await.unwrap();
    let a = h.row("a").await.unwrap();
    assert_eq!(inner.parent_id, Some(outer.id));
    assert_eq!(a.parent_id, Some(inner.id));
}

#[tokio::test]
async fn root_without_remote_id_is_resolved_first() {
    let h = harness().await;
    h.index
        .update_root_folder_id(h.account.id, None)
        .await
        .unwrap();
    h.fake.put_remote("a", ROOT_ID, "a.txt", Some(b"a"));

    h.changes.sync_changes(h.account.id).await.unwrap();

    let root = h
        .index
        .root_document(StorageType::Drive, Some(h.account.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(root.back_entry_id.as_deref(), Some(ROOT_ID));
    let account = h.index.get_account(h.account.id).await.unwrap().unwrap();
    assert_eq!(account.root_folder_id.as_deref(), Some(ROOT_ID));
    assert_eq!(h.row("a").await.unwrap().parent_id, Some(root.id));
}

#[tokio::test]
async fn transient_failure_replans_and_retries() {
    let h = harness().await;
    h.fake.put_remote("a", ROOT_ID, "a.txt", Some(b"a"));
    h.fake
        .fail_next("changes", StorageError::new(Reason::Network, "reset"));
    let worker = tokio::spawn(Arc::clone(&h.changes).run_worker());

    h.changes.enqueue(h.account.id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), h.changes.wait_idle())
        .await
        .unwrap();

    assert_eq!(h.fake.calls("changes"), 2);
    assert_eq!(h.account_state().await, ChangesSyncState::Done);
    assert!(h.row("a").await.is_some());
    h.control.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn permanent_failure_marks_the_pass_failed() {
    let h = harness().await;
    h.fake
        .fail_next("changes", StorageError::new(Reason::InvalidResponse, "garbage"));

    h.changes.process(h.account.id).await.unwrap();

    assert_eq!(h.account_state().await, ChangesSyncState::Failed);
    assert_eq!(h.cursor().await, None);
}

#[tokio::test]
async fn planned_downloads_are_run_by_the_document_engine() {
    let h = harness().await;
    let sealed = h.seal(b"remote text").await;
    h.fake.put_remote("a", ROOT_ID, "a.txt", Some(&sealed));
    let worker = tokio::spawn(Arc::clone(&h.documents).run_worker());

    h.changes.process(h.account.id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), h.documents.wait_idle())
        .await
        .unwrap();

    let row = h.row("a").await.unwrap();
    assert_eq!(row.download_state, SyncState::Done);
    assert!(row.local_file_name.is_some());
    assert_eq!(h.account_state().await, ChangesSyncState::Done);
    h.control.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn vanished_folder_with_unsent_children_is_kept() {
    let h = harness().await;
    h.fake.put_remote("vf", ROOT_ID, "drafts", None);
    h.changes.sync_changes(h.account.id).await.unwrap();
    let folder = h.row("vf").await.unwrap();

    let mut input = DocumentInput::new(
        "note.txt",
        "text/plain",
        false,
        StorageType::Drive,
        Some(h.account.id),
    )
    .with_parent(folder.id);
    input.upload_state = SyncState::Planned;
    let child = h.index.insert_document(&input).await.unwrap();
    h.index
        .update_local_file(child.id, Some(&BlobStore::blob_name_for(child.id)), Some(4), Some(1))
        .await
        .unwrap();

    h.fake.remove_remote("vf");
    h.index
        .update_last_remote_change_id(h.account.id, None)
        .await
        .unwrap();
    assert_eq!(h.changes.sync_changes(h.account.id).await.unwrap(), 0);

    let folder = h.index.require_document(folder.id).await.unwrap();
    assert_eq!(folder.deletion_state, SyncState::Done);
    let child = h.index.require_document(child.id).await.unwrap();
    assert_eq!(child.upload_state, SyncState::Planned);
    assert!(child.local_file_name.is_some());
}

#[tokio::test]
async fn vanished_folder_with_settled_children_is_removed() {
    let h = harness().await;
    h.fake.put_remote("vf", ROOT_ID, "drafts", None);
    h.fake.put_remote("a", "vf", "a.txt", Some(b"a"));
    h.changes.sync_changes(h.account.id).await.unwrap();
    let folder = h.row("vf").await.unwrap();
    let a = h.row("a").await.unwrap();
    h.settle_download(a.id).await;

    h.fake.remove_remote("a");
    h.fake.remove_remote("vf");
    h.index
        .update_last_remote_change_id(h.account.id, None)
        .await
        .unwrap();
    h.changes.sync_changes(h.account.id).await.unwrap();

    let folder = h.index.require_document(folder.id).await.unwrap();
    assert_eq!(folder.deletion_state, SyncState::Planned);
}
