//! Virtual Filesystem Browser
//!
//! Simulates folders over the flat key namespace of a bucket. The current
//! prefix, the last listing, the selection and the view filter live in a
//! `BrowserState` that only changes through `BrowserState::apply`.
//!
//! Listings race: a slow response for a prefix the user already left must
//! never replace the listing of the prefix they are looking at. Every listing
//! request carries a `ListTicket`; its response is applied only if the ticket
//! is still the latest one issued and the prefix has not changed since.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::file_types::{FileKind, FilterType};
use crate::providers::{CommonPrefix, Listing, ObjectEntry, ObjectStore, StorageError};

/// Why the last listing failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListFailure {
    /// No HTTP response at all; for a browser client this is a missing CORS rule set
    NeedsCorsSetup(String),
    /// Credentials rejected or bucket policy denies listing
    AccessDenied(String),
    Other(String),
}

impl ListFailure {
    pub fn classify(err: &StorageError) -> Self {
        if err.is_transport() {
            ListFailure::NeedsCorsSetup(err.to_string())
        } else if err.is_access_denied() {
            ListFailure::AccessDenied(err.to_string())
        } else {
            ListFailure::Other(err.to_string())
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ListFailure::NeedsCorsSetup(m) | ListFailure::AccessDenied(m) | ListFailure::Other(m) => m,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ListStatus {
    #[default]
    Idle,
    Loading,
    Loaded,
    Failed(ListFailure),
}

/// Identifies one listing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListTicket {
    pub seq: u64,
    pub prefix: String,
}

/// Every state transition of the browser
#[derive(Debug, Clone)]
pub enum BrowserEvent {
    Navigate(String),
    ListRequested(ListTicket),
    ListSucceeded(ListTicket, Listing),
    ListFailed(ListTicket, ListFailure),
    Select(String),
    Deselect(String),
    Toggle(String),
    SelectAllVisible,
    ClearSelection,
    SetFilter(FilterType),
    SetSearch(String),
}

/// One segment of the breadcrumb trail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breadcrumb {
    pub label: String,
    /// Prefix to navigate to when the crumb is chosen
    pub prefix: String,
}

#[derive(Debug, Clone, Default)]
pub struct BrowserState {
    pub prefix: String,
    pub folders: Vec<CommonPrefix>,
    pub files: Vec<ObjectEntry>,
    pub status: ListStatus,
    pub selection: BTreeSet<String>,
    pub filter: FilterType,
    pub search: String,
    latest_request: u64,
}

impl BrowserState {
    /// Next ticket for the current prefix
    pub fn next_ticket(&self) -> ListTicket {
        ListTicket {
            seq: self.latest_request + 1,
            prefix: self.prefix.clone(),
        }
    }

    fn is_current(&self, ticket: &ListTicket) -> bool {
        ticket.seq == self.latest_request && ticket.prefix == self.prefix
    }

    /// Apply one event. Returns false when the event was dropped as stale.
    pub fn apply(&mut self, event: BrowserEvent) -> bool {
        match event {
            BrowserEvent::Navigate(prefix) => {
                self.prefix = prefix;
                self.folders.clear();
                self.files.clear();
                self.selection.clear();
                self.status = ListStatus::Idle;
            }
            BrowserEvent::ListRequested(ticket) => {
                if ticket.seq <= self.latest_request {
                    return false;
                }
                self.latest_request = ticket.seq;
                self.status = ListStatus::Loading;
            }
            BrowserEvent::ListSucceeded(ticket, listing) => {
                if !self.is_current(&ticket) {
                    return false;
                }
                self.folders = listing.folders;
                self.files = listing.files;
                let files = &self.files;
                self.selection.retain(|key| files.iter().any(|f| &f.key == key));
                self.status = ListStatus::Loaded;
            }
            BrowserEvent::ListFailed(ticket, failure) => {
                if !self.is_current(&ticket) {
                    return false;
                }
                self.folders.clear();
                self.files.clear();
                self.status = ListStatus::Failed(failure);
            }
            BrowserEvent::Select(key) => {
                self.selection.insert(key);
            }
            BrowserEvent::Deselect(key) => {
                self.selection.remove(&key);
            }
            BrowserEvent::Toggle(key) => {
                if !self.selection.remove(&key) {
                    self.selection.insert(key);
                }
            }
            BrowserEvent::SelectAllVisible => {
                let keys: Vec<String> = self.visible_files().map(|f| f.key.clone()).collect();
                self.selection.extend(keys);
            }
            BrowserEvent::ClearSelection => self.selection.clear(),
            BrowserEvent::SetFilter(filter) => self.filter = filter,
            BrowserEvent::SetSearch(query) => self.search = query.trim().to_string(),
        }
        true
    }

    fn matches_search(&self, name: &str) -> bool {
        self.search.is_empty() || name.to_lowercase().contains(&self.search.to_lowercase())
    }

    /// Folders passing the search query (the kind filter never hides folders)
    pub fn visible_folders(&self) -> impl Iterator<Item = &CommonPrefix> + '_ {
        self.folders
            .iter()
            .filter(|f| self.matches_search(&folder_display_name(&f.prefix, &self.prefix)))
    }

    /// Files passing both the kind filter and the search query
    pub fn visible_files(&self) -> impl Iterator<Item = &ObjectEntry> + '_ {
        self.files.iter().filter(|f| {
            self.filter.matches(FileKind::of(&f.key)) && self.matches_search(f.name())
        })
    }

    /// Loaded and nothing to show; distinct from a failed listing
    pub fn is_empty_folder(&self) -> bool {
        self.status == ListStatus::Loaded && self.folders.is_empty() && self.files.is_empty()
    }

    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        breadcrumbs(&self.prefix)
    }
}

/// Breadcrumb trail for a prefix, root excluded (the root crumb navigates to "")
pub fn breadcrumbs(prefix: &str) -> Vec<Breadcrumb> {
    let segments: Vec<&str> = prefix.split('/').filter(|s| !s.is_empty()).collect();
    (0..segments.len())
        .map(|i| Breadcrumb {
            label: segments[i].to_string(),
            prefix: format!("{}/", segments[..=i].join("/")),
        })
        .collect()
}

/// Display name of a common prefix relative to the current prefix
pub fn folder_display_name(common_prefix: &str, current_prefix: &str) -> String {
    common_prefix
        .strip_prefix(current_prefix)
        .unwrap_or(common_prefix)
        .trim_end_matches('/')
        .to_string()
}

/// Prefix one level up ("" at the root)
pub fn parent_prefix(prefix: &str) -> String {
    let mut crumbs = breadcrumbs(prefix);
    crumbs.pop();
    crumbs.pop().map(|c| c.prefix).unwrap_or_default()
}

/// Shared browser handle
#[derive(Clone)]
pub struct Browser {
    store: Arc<dyn ObjectStore>,
    state: Arc<RwLock<BrowserState>>,
}

impl Browser {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            state: Arc::new(RwLock::new(BrowserState::default())),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> BrowserState {
        self.state.read().await.clone()
    }

    pub async fn prefix(&self) -> String {
        self.state.read().await.prefix.clone()
    }

    pub async fn dispatch(&self, event: BrowserEvent) -> bool {
        self.state.write().await.apply(event)
    }

    /// List the current prefix.
    ///
    /// Returns `Ok(false)` when the response arrived after a newer request or a
    /// prefix change and was dropped.
    pub async fn list(&self) -> Result<bool, StorageError> {
        let ticket = {
            let mut state = self.state.write().await;
            let ticket = state.next_ticket();
            state.apply(BrowserEvent::ListRequested(ticket.clone()));
            ticket
        };

        let result = self.store.list(&ticket.prefix).await;

        let mut state = self.state.write().await;
        match result {
            Ok(listing) => {
                let count = listing.folders.len() + listing.files.len();
                let applied = state.apply(BrowserEvent::ListSucceeded(ticket.clone(), listing));
                if applied {
                    debug!("Listed '{}': {} item(s)", ticket.prefix, count);
                } else {
                    debug!("Dropped stale listing #{} for '{}'", ticket.seq, ticket.prefix);
                }
                Ok(applied)
            }
            Err(e) => {
                let failure = ListFailure::classify(&e);
                if !state.apply(BrowserEvent::ListFailed(ticket.clone(), failure)) {
                    debug!("Dropped stale listing error #{} for '{}': {}", ticket.seq, ticket.prefix, e);
                    return Ok(false);
                }
                warn!("Listing '{}' failed: {}", ticket.prefix, e);
                Err(e)
            }
        }
    }

    pub async fn refresh(&self) -> Result<bool, StorageError> {
        self.list().await
    }

    /// Change the current prefix, clear the selection and re-list
    pub async fn navigate(&self, prefix: &str) -> Result<bool, StorageError> {
        self.dispatch(BrowserEvent::Navigate(prefix.to_string())).await;
        self.list().await
    }

    pub async fn navigate_up(&self) -> Result<bool, StorageError> {
        let parent = parent_prefix(&self.prefix().await);
        self.navigate(&parent).await
    }

    pub async fn open_folder(&self, name: &str) -> Result<bool, StorageError> {
        let target = format!("{}{}/", self.prefix().await, name.trim_matches('/'));
        self.navigate(&target).await
    }

    /// Re-list after a mutation that already succeeded on the store
    async fn relist_after(&self, action: &str) {
        if let Err(e) = self.list().await {
            warn!("Refresh after {} failed: {}", action, e);
        }
    }

    /// Create a folder marker under the current prefix and re-list
    pub async fn create_folder(&self, name: &str) -> Result<String, StorageError> {
        let name = name.trim().trim_matches('/');
        if name.is_empty() {
            return Err(StorageError::InvalidPath("empty folder name".to_string()));
        }
        let key = self
            .store
            .create_folder(&format!("{}{}", self.prefix().await, name))
            .await?;
        self.relist_after("folder creation").await;
        Ok(key)
    }

    /// Rename an object within the current prefix: copy, then delete the source.
    ///
    /// Not atomic. If the delete fails both keys exist.
    pub async fn rename(&self, key: &str, new_name: &str) -> Result<String, StorageError> {
        let new_name = new_name.trim();
        if new_name.is_empty() || new_name.contains('/') {
            return Err(StorageError::InvalidPath(format!("invalid name '{}'", new_name)));
        }
        let new_key = format!("{}{}", self.prefix().await, new_name);
        if new_key == key {
            return Ok(new_key);
        }

        self.store.copy(key, &new_key).await?;
        self.store.delete(&[key.to_string()]).await?;
        info!("Renamed {} -> {}", key, new_key);
        self.relist_after("rename").await;
        Ok(new_key)
    }

    /// Delete every selected key, clear the selection and re-list
    pub async fn delete_selected(&self) -> Result<usize, StorageError> {
        let keys: Vec<String> = self.state.read().await.selection.iter().cloned().collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let result = self.store.delete(&keys).await;
        self.dispatch(BrowserEvent::ClearSelection).await;
        self.relist_after("delete").await;
        result?;
        info!("Deleted {} selected object(s)", keys.len());
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::memory::MemoryStore;
    use std::time::Duration;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_objects([
            ("readme.md", b"# hi".as_slice()),
            ("photos/", b"".as_slice()),
            ("photos/beach.jpg", b"jpg".as_slice()),
            ("photos/notes.txt", b"txt".as_slice()),
            ("photos/2024/jan.png", b"png".as_slice()),
            ("videos/clip.mp4", b"mp4".as_slice()),
        ]))
    }

    fn refused() -> StorageError {
        StorageError::NetworkError("connection refused".to_string())
    }

    fn denied() -> StorageError {
        StorageError::PermissionDenied("AccessDenied".to_string())
    }

    #[test]
    fn test_breadcrumbs() {
        assert!(breadcrumbs("").is_empty());
        let crumbs = breadcrumbs("a/b/c/");
        assert_eq!(crumbs.len(), 3);
        assert_eq!(crumbs[0], Breadcrumb { label: "a".into(), prefix: "a/".into() });
        assert_eq!(crumbs[1].prefix, "a/b/");
        assert_eq!(crumbs[2].prefix, "a/b/c/");
        // Empty segments are dropped
        assert_eq!(breadcrumbs("a//b/")[1].prefix, "a/b/");
    }

    #[test]
    fn test_breadcrumb_target_yields_its_own_trail() {
        for prefix in ["a/", "a/b/", "photos/2024/jan/", "x//y/z/"] {
            let crumbs = breadcrumbs(prefix);
            for (i, crumb) in crumbs.iter().enumerate() {
                assert_eq!(breadcrumbs(&crumb.prefix), crumbs[..=i].to_vec(), "{prefix} at {i}");
            }
        }
    }

    #[test]
    fn test_folder_display_name_and_parent() {
        assert_eq!(folder_display_name("photos/2024/", "photos/"), "2024");
        assert_eq!(folder_display_name("docs/", ""), "docs");
        assert_eq!(parent_prefix("a/b/"), "a/");
        assert_eq!(parent_prefix("a/"), "");
        assert_eq!(parent_prefix(""), "");
    }

    #[test]
    fn test_reducer_drops_stale_ticket() {
        let mut state = BrowserState::default();
        let first = state.next_ticket();
        assert!(state.apply(BrowserEvent::ListRequested(first.clone())));
        let second = state.next_ticket();
        assert!(state.apply(BrowserEvent::ListRequested(second.clone())));

        let newer = Listing::from_items("", vec![]);
        assert!(state.apply(BrowserEvent::ListSucceeded(second, newer)));
        let older = Listing {
            prefix: String::new(),
            folders: vec![CommonPrefix::new("old/")],
            files: vec![],
        };
        assert!(!state.apply(BrowserEvent::ListSucceeded(first, older)));
        assert!(state.folders.is_empty());
        assert!(state.is_empty_folder());
    }

    #[test]
    fn test_reducer_drops_response_for_left_prefix() {
        let mut state = BrowserState::default();
        let ticket = state.next_ticket();
        state.apply(BrowserEvent::ListRequested(ticket.clone()));
        state.apply(BrowserEvent::Navigate("docs/".into()));

        let listing = Listing {
            prefix: String::new(),
            folders: vec![CommonPrefix::new("docs/")],
            files: vec![],
        };
        assert!(!state.apply(BrowserEvent::ListSucceeded(ticket, listing)));
        assert_eq!(state.prefix, "docs/");
        assert_eq!(state.status, ListStatus::Idle);
    }

    #[test]
    fn test_selection_events() {
        let mut state = BrowserState {
            files: vec![ObjectEntry::new("a.txt", 1), ObjectEntry::new("b.png", 1)],
            ..Default::default()
        };
        state.apply(BrowserEvent::Toggle("a.txt".into()));
        assert!(state.selection.contains("a.txt"));
        state.apply(BrowserEvent::Toggle("a.txt".into()));
        assert!(state.selection.is_empty());

        state.apply(BrowserEvent::SetFilter(FilterType::Image));
        state.apply(BrowserEvent::SelectAllVisible);
        assert_eq!(state.selection.iter().collect::<Vec<_>>(), vec!["b.png"]);

        state.apply(BrowserEvent::Navigate("x/".into()));
        assert!(state.selection.is_empty());
    }

    #[tokio::test]
    async fn test_navigate_partitions_listing() {
        let browser = Browser::new(store());
        assert!(browser.navigate("photos/").await.unwrap());

        let state = browser.snapshot().await;
        assert_eq!(state.status, ListStatus::Loaded);
        assert_eq!(state.folders, vec![CommonPrefix::new("photos/2024/")]);
        // The "photos/" marker is not a file
        let keys: Vec<&str> = state.files.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["photos/beach.jpg", "photos/notes.txt"]);
    }

    #[tokio::test]
    async fn test_root_listing_and_navigation_helpers() {
        let browser = Browser::new(store());
        browser.list().await.unwrap();
        let state = browser.snapshot().await;
        assert_eq!(
            state.folders,
            vec![CommonPrefix::new("photos/"), CommonPrefix::new("videos/")]
        );
        assert_eq!(state.files[0].key, "readme.md");

        browser.open_folder("photos").await.unwrap();
        browser.open_folder("2024").await.unwrap();
        assert_eq!(browser.prefix().await, "photos/2024/");
        assert_eq!(browser.snapshot().await.files[0].key, "photos/2024/jan.png");

        browser.navigate_up().await.unwrap();
        assert_eq!(browser.prefix().await, "photos/");
    }

    #[tokio::test]
    async fn test_visible_files_filter_and_search() {
        let browser = Browser::new(store());
        browser.navigate("photos/").await.unwrap();
        browser.dispatch(BrowserEvent::SetFilter(FilterType::Code)).await;
        let state = browser.snapshot().await;
        let visible: Vec<&str> = state.visible_files().map(|f| f.name()).collect();
        assert_eq!(visible, vec!["notes.txt"]);

        browser.dispatch(BrowserEvent::SetFilter(FilterType::All)).await;
        browser.dispatch(BrowserEvent::SetSearch("BEACH".into())).await;
        let state = browser.snapshot().await;
        let visible: Vec<&str> = state.visible_files().map(|f| f.name()).collect();
        assert_eq!(visible, vec!["beach.jpg"]);
        assert_eq!(state.visible_folders().count(), 0);
    }

    #[tokio::test]
    async fn test_slow_listing_for_left_prefix_is_dropped() {
        let store = store();
        store
            .list_delays
            .lock()
            .unwrap()
            .insert("photos/".to_string(), Duration::from_millis(200));
        let browser = Browser::new(store);

        let slow = browser.navigate("photos/");
        let fast = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            browser.navigate("videos/").await
        };
        let (slow, fast) = tokio::join!(slow, fast);

        assert!(!slow.unwrap());
        assert!(fast.unwrap());
        let state = browser.snapshot().await;
        assert_eq!(state.prefix, "videos/");
        assert_eq!(state.files[0].key, "videos/clip.mp4");
    }

    #[tokio::test]
    async fn test_transport_failure_needs_cors() {
        let store = store();
        *store.list_error.lock().unwrap() = Some(refused as fn() -> StorageError);
        let browser = Browser::new(store);

        assert!(browser.list().await.is_err());
        match browser.snapshot().await.status {
            ListStatus::Failed(ListFailure::NeedsCorsSetup(_)) => {}
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_access_denied_is_not_cors() {
        let store = store();
        *store.list_error.lock().unwrap() = Some(denied as fn() -> StorageError);
        let browser = Browser::new(store);

        assert!(browser.list().await.is_err());
        let state = browser.snapshot().await;
        assert!(matches!(state.status, ListStatus::Failed(ListFailure::AccessDenied(_))));
        assert!(!state.is_empty_folder());
    }

    #[tokio::test]
    async fn test_rename_copies_then_deletes() {
        let store = store();
        let browser = Browser::new(store.clone());
        browser.navigate("photos/").await.unwrap();

        let new_key = browser.rename("photos/notes.txt", "todo.txt").await.unwrap();
        assert_eq!(new_key, "photos/todo.txt");
        let keys = store.keys();
        assert!(keys.contains(&"photos/todo.txt".to_string()));
        assert!(!keys.contains(&"photos/notes.txt".to_string()));
        assert!(browser.snapshot().await.files.iter().any(|f| f.key == "photos/todo.txt"));

        assert!(browser.rename("photos/todo.txt", "a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_mutations_succeed_when_relist_fails() {
        let store = store();
        let browser = Browser::new(store.clone());
        browser.navigate("photos/").await.unwrap();
        browser.dispatch(BrowserEvent::Select("photos/beach.jpg".to_string())).await;
        *store.list_error.lock().unwrap() = Some(refused as fn() -> StorageError);

        assert_eq!(browser.rename("photos/notes.txt", "todo.txt").await.unwrap(), "photos/todo.txt");
        assert_eq!(browser.create_folder("raw").await.unwrap(), "photos/raw/");
        assert_eq!(browser.delete_selected().await.unwrap(), 1);

        let keys = store.keys();
        assert!(keys.contains(&"photos/todo.txt".to_string()));
        assert!(keys.contains(&"photos/raw/".to_string()));
        assert!(!keys.contains(&"photos/beach.jpg".to_string()));
        assert!(matches!(browser.snapshot().await.status, ListStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_delete_selected_and_create_folder() {
        let store = store();
        let browser = Browser::new(store.clone());
        browser.navigate("photos/").await.unwrap();
        browser.dispatch(BrowserEvent::SelectAllVisible).await;

        assert_eq!(browser.delete_selected().await.unwrap(), 2);
        let state = browser.snapshot().await;
        assert!(state.selection.is_empty());
        assert!(state.files.is_empty());

        assert_eq!(browser.create_folder("raw").await.unwrap(), "photos/raw/");
        assert!(store.keys().contains(&"photos/raw/".to_string()));
        assert_eq!(browser.delete_selected().await.unwrap(), 0);
    }
}
