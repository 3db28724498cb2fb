//! Allocation Module Tests
//!
//! ## Test Scopes
//! - **Single-flight lock**: exclusivity in both modes, guarded dispatch.
//! - **Identifier allocator**: formatting, contiguity under concurrency,
//!   dataset assignment.
//! - **Revision allocator**: numbering rules, duplicate files, concurrency.

#[cfg(test)]
mod tests {
    use crate::allocation::*;
    use crate::executor::thread::ThreadTaskService;
    use crate::executor::{
        AsyncTaskService, IdGenerator, TaskError, TaskInvocation, TaskRegistry, TaskStatus,
    };
    use crate::storage::{
        CacheError, CacheService, CacheTtl, Database, MemoryCache, MemoryDatabase, NewRevision,
        RevisionStatus, StoreError,
    };

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // ============================================================
    // FIXTURES
    // ============================================================

    fn database() -> Arc<MemoryDatabase> {
        Arc::new(MemoryDatabase::seeded(Duration::from_secs(10)))
    }

    async fn set_counter(db: &MemoryDatabase, prefix: &str, value: i64) {
        let mut tx = db.begin().await.unwrap();
        let mut identifier = tx.identifier_for_update(prefix).await.unwrap().unwrap();
        identifier.last_value = value;
        tx.save_identifier(&identifier).await.unwrap();
        tx.commit().await.unwrap();
    }

    fn request(accession: &str, sha: &str) -> RevisionRequest {
        RevisionRequest {
            repository_id: "repo-1".to_string(),
            accession: accession.to_string(),
            task_id: format!("task-{sha}"),
            description: "new release".to_string(),
            file_sha256: sha.to_string(),
            repository_revision: Some("1.0".to_string()),
        }
    }

    async fn dataset_with_accession(db: Arc<MemoryDatabase>) -> String {
        IdentifierAllocator::new(db)
            .assign_dataset("mhd", "repo-1", "ST000001")
            .await
            .unwrap()
            .accession
    }

    fn lock(cache: Arc<MemoryCache>, mode: LockMode) -> SingleFlightLock {
        SingleFlightLock::new(cache, mode, DEFAULT_LOCK_TTL)
    }

    async fn slow(_invocation: TaskInvocation) -> Result<Value> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(json!("done"))
    }

    // ============================================================
    // SINGLE-FLIGHT LOCK TESTS
    // ============================================================

    #[tokio::test]
    async fn test_lock_key_format() {
        assert_eq!(
            SingleFlightLock::key("new-revision", "MHDA000001"),
            "new-revision:MHDA000001"
        );
    }

    #[tokio::test]
    async fn test_sequential_acquire_is_exclusive_in_both_modes() {
        for mode in [LockMode::CheckThenSet, LockMode::Atomic] {
            let cache = Arc::new(MemoryCache::new());
            let lock = lock(cache.clone(), mode);

            lock.acquire("op:r1", &"first".into()).await.unwrap();
            let err = lock.acquire("op:r1", &"second".into()).await.unwrap_err();

            match err {
                TaskError::DuplicateSubmission {
                    resource_key,
                    task_id,
                } => {
                    assert_eq!(resource_key, "op:r1");
                    assert_eq!(task_id, "first", "mode {mode}");
                }
                other => panic!("Expected DuplicateSubmission, got {:?}", other),
            }
            assert_eq!(err_status(&lock, "op:r1").await, Some("first".to_string()));

            // Other resources are independent
            lock.acquire("op:r2", &"second".into()).await.unwrap();
        }
    }

    async fn err_status(lock: &SingleFlightLock, key: &str) -> Option<String> {
        lock.holder(key).await.unwrap().map(|id| id.to_string())
    }

    #[tokio::test]
    async fn test_lock_ttl_and_release() {
        let cache = Arc::new(MemoryCache::new());
        let lock = lock(cache.clone(), LockMode::Atomic);

        lock.acquire("op:r", &"t1".into()).await.unwrap();
        match cache.ttl("op:r").await.unwrap() {
            CacheTtl::Expires(left) => assert!(left <= DEFAULT_LOCK_TTL),
            other => panic!("Lock key should expire, got {:?}", other),
        }

        assert!(lock.release("op:r").await.unwrap());
        assert!(!lock.release("op:r").await.unwrap());
        lock.acquire("op:r", &"t2".into()).await.unwrap();
    }

    /// Refuses the first `set_if_absent` as if a holder expired right after
    /// the refusal.
    struct ExpiringHolderCache {
        inner: MemoryCache,
        refusals: AtomicUsize,
    }

    #[async_trait]
    impl CacheService for ExpiringHolderCache {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
            self.inner.set(key, value, ttl).await
        }

        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<bool, CacheError> {
            if self.refusals.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(false);
            }
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool, CacheError> {
            self.inner.delete(key).await
        }

        async fn ttl(&self, key: &str) -> Result<CacheTtl, CacheError> {
            self.inner.ttl(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool, CacheError> {
            self.inner.exists(key).await
        }

        async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
            self.inner.keys(pattern).await
        }

        async fn ping(&self) -> Result<bool, CacheError> {
            self.inner.ping().await
        }

        fn connection_repr(&self) -> String {
            self.inner.connection_repr()
        }
    }

    #[tokio::test]
    async fn test_atomic_lock_retries_when_holder_vanishes() {
        // ARRANGE
        let cache = Arc::new(ExpiringHolderCache {
            inner: MemoryCache::new(),
            refusals: AtomicUsize::new(0),
        });
        let lock = SingleFlightLock::new(cache.clone(), LockMode::Atomic, DEFAULT_LOCK_TTL);

        // ACT
        lock.acquire("op:r", &"t1".into()).await.unwrap();

        // ASSERT
        assert_eq!(cache.refusals.load(Ordering::SeqCst), 2);
        assert_eq!(err_status(&lock, "op:r").await, Some("t1".to_string()));
        let err = lock.acquire("op:r", &"t2".into()).await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::DuplicateSubmission { task_id, .. } if task_id == "t1"
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_atomic_lock_admits_one_of_many_concurrent_callers() {
        let cache = Arc::new(MemoryCache::new());
        let lock = Arc::new(lock(cache, LockMode::Atomic));

        let mut handles = Vec::new();
        for i in 0..16 {
            let lock = lock.clone();
            handles.push(tokio::spawn(async move {
                lock.acquire("op:hot", &format!("t{i}").into()).await.is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_forced_id_duplicate_submission_scenario() {
        // ARRANGE
        let registry = TaskRegistry::new();
        let task = registry
            .register("hub", "submission", "tests.slow", slow)
            .unwrap();
        registry.seal();
        let service = ThreadTaskService::new("hub", registry);
        let cache = Arc::new(MemoryCache::new());
        let lock = lock(cache, LockMode::Atomic);
        let key = SingleFlightLock::key("new-revision", "MHDA000001");

        // ACT
        let first = lock
            .start_guarded(
                &key,
                &service,
                &task,
                Some(IdGenerator::fixed("abc")),
                Default::default(),
                None,
            )
            .await
            .unwrap();
        let second = lock
            .start_guarded(&key, &service, &task, None, Default::default(), None)
            .await;

        // ASSERT
        assert_eq!(first.task_id().as_str(), "abc");
        match second {
            Err(TaskError::DuplicateSubmission { task_id, .. }) => assert_eq!(task_id, "abc"),
            other => panic!("Expected DuplicateSubmission, got {:?}", other),
        }
        assert_eq!(service.tracked(), 1, "The second task never started");

        let value = first.get(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(value, json!("done"));
    }

    #[tokio::test]
    async fn test_guarded_start_releases_lock_on_failure() {
        let registry = TaskRegistry::new();
        let foreign = registry
            .register("other", "common", "tests.slow", slow)
            .unwrap();
        registry.seal();
        let service = ThreadTaskService::new("hub", registry);
        let cache = Arc::new(MemoryCache::new());
        let lock = lock(cache.clone(), LockMode::Atomic);

        let err = lock
            .start_guarded("op:r", &service, &foreign, None, Default::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::NotRegistered { .. }));
        assert!(!cache.exists("op:r").await.unwrap(), "Lock must not leak");
    }

    #[tokio::test]
    async fn test_guarded_start_rejects_empty_forced_id() {
        let registry = TaskRegistry::new();
        let task = registry.register("hub", "common", "tests.slow", slow).unwrap();
        let service = ThreadTaskService::new("hub", registry);
        let cache = Arc::new(MemoryCache::new());
        let lock = lock(cache.clone(), LockMode::Atomic);

        let err = lock
            .start_guarded(
                "op:r",
                &service,
                &task,
                Some(IdGenerator::fixed("")),
                Default::default(),
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::InvalidTaskId));
        assert!(cache.is_empty());
        assert!(service.get_result("").await.is_err());
    }

    #[test]
    fn test_lock_mode_names() {
        assert_eq!(LockMode::default(), LockMode::Atomic);
        assert_eq!("check-then-set".parse::<LockMode>(), Ok(LockMode::CheckThenSet));
        assert_eq!(LockMode::Atomic.to_string(), "atomic");
        assert!("sometimes".parse::<LockMode>().is_err());
    }

    // ============================================================
    // IDENTIFIER ALLOCATOR TESTS
    // ============================================================

    #[tokio::test]
    async fn test_allocator_continues_from_last_value() {
        // ARRANGE
        let db = database();
        set_counter(&db, "mhd", 5).await;
        let allocator = IdentifierAllocator::new(db.clone());

        // ACT
        let first = allocator.allocate("mhd").await.unwrap();
        let second = allocator.allocate("mhd").await.unwrap();

        // ASSERT
        assert_eq!(first, "MHDA000006");
        assert_eq!(second, "MHDA000007");
        assert_eq!(db.identifier("mhd").await.unwrap().unwrap().last_value, 7);
    }

    #[tokio::test]
    async fn test_allocator_formats() {
        let db = database();
        let allocator = IdentifierAllocator::new(db.clone())
            .with_format("mhd_test", AccessionFormat::new("TEST-", 3));

        assert_eq!(allocator.allocate("mhd_test").await.unwrap(), "TEST-001");

        db.ensure_identifier("plain", 41).await.unwrap();
        assert_eq!(allocator.allocate("plain").await.unwrap(), "plain000042");
    }

    #[tokio::test]
    async fn test_missing_prefix_is_rejected() {
        let allocator = IdentifierAllocator::new(database());

        let err = allocator.allocate("nope").await.unwrap_err();

        assert!(matches!(err, AllocationError::IdentifierMissing { ref prefix } if prefix == "nope"));
        assert_eq!(err.http_status(), 500);
        let outcome = err.to_outcome::<Value>();
        assert!(!outcome.success);
        assert!(outcome.is_consistent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_are_contiguous() {
        let db = database();
        set_counter(&db, "mhd", 10).await;
        let allocator = Arc::new(IdentifierAllocator::new(db));

        let mut handles = Vec::new();
        for _ in 0..25 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(
                async move { allocator.allocate("mhd").await.unwrap() },
            ));
        }

        let mut numbers = Vec::new();
        for handle in handles {
            let accession = handle.await.unwrap();
            numbers.push(accession.trim_start_matches("MHDA").parse::<i64>().unwrap());
        }
        numbers.sort();

        let expected: Vec<i64> = (11..=35).collect();
        assert_eq!(numbers, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_prefixes_do_not_share_counters() {
        let db = database();
        let allocator = Arc::new(IdentifierAllocator::new(db));

        let a = allocator.clone();
        let b = allocator.clone();
        let (left, right) = tokio::join!(
            tokio::spawn(async move { a.allocate("mhd").await.unwrap() }),
            tokio::spawn(async move { b.allocate("mhd_test").await.unwrap() })
        );

        assert_eq!(left.unwrap(), "MHDA000001");
        assert_eq!(right.unwrap(), "MHDT000001");
    }

    #[tokio::test]
    async fn test_assign_dataset_creates_private_dataset() {
        let db = database();
        let allocator = IdentifierAllocator::new(db.clone());

        let dataset = allocator
            .assign_dataset("mhd", "repo-1", "ST000001")
            .await
            .unwrap();

        assert_eq!(dataset.accession, "MHDA000001");
        assert_eq!(dataset.revision, 0);
        assert_eq!(dataset.status, crate::storage::DatasetStatus::Private);
        assert!(db.dataset("MHDA000001").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_assign_dataset_rejects_existing_reference_without_consuming() {
        let db = database();
        let allocator = IdentifierAllocator::new(db.clone());
        allocator
            .assign_dataset("mhd", "repo-1", "ST000001")
            .await
            .unwrap();

        let err = allocator
            .assign_dataset("mhd", "repo-1", "ST000001")
            .await
            .unwrap_err();

        match &err {
            AllocationError::DatasetExists { accession, .. } => assert_eq!(accession, "MHDA000001"),
            other => panic!("Expected DatasetExists, got {:?}", other),
        }
        assert_eq!(
            err.to_string(),
            "repo-1 dataset with identifier ST000001 already exists."
        );
        assert_eq!(
            db.identifier("mhd").await.unwrap().unwrap().last_value,
            1,
            "Rejected assignment must not consume a number"
        );
    }

    // ============================================================
    // REVISION ALLOCATOR TESTS
    // ============================================================

    #[tokio::test]
    async fn test_first_revisions_are_sequential() {
        let db = database();
        let accession = dataset_with_accession(db.clone()).await;
        let allocator = RevisionAllocator::new(db.clone());

        let first = allocator.create_revision(&request(&accession, "a")).await.unwrap();
        let second = allocator.create_revision(&request(&accession, "b")).await.unwrap();

        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 2);
        assert_eq!(second.status, RevisionStatus::Valid);

        let dataset = db.dataset(&accession).await.unwrap().unwrap();
        assert_eq!(dataset.revision, 2);
        assert!(dataset.revision_datetime.is_some());
        assert!(dataset.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_same_file_is_rejected() {
        let db = database();
        let accession = dataset_with_accession(db.clone()).await;
        let allocator = RevisionAllocator::new(db.clone());
        allocator.create_revision(&request(&accession, "a")).await.unwrap();

        let err = allocator
            .create_revision(&request(&accession, "a"))
            .await
            .unwrap_err();

        assert!(matches!(err, AllocationError::DuplicateFile { .. }));
        assert_eq!(db.revision_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_dataset_is_rejected() {
        let allocator = RevisionAllocator::new(database());

        let err = allocator
            .create_revision(&request("MHDA999999", "a"))
            .await
            .unwrap_err();

        assert!(matches!(err, AllocationError::DatasetNotFound { .. }));
        assert_eq!(err.http_status(), 404);
        assert_eq!(err.to_string(), "Dataset MHDA999999 not found in the database.");
    }

    #[tokio::test]
    async fn test_revision_skips_past_stray_rows() {
        // ARRANGE: a revision row ahead of the dataset's recorded revision
        let db = database();
        let accession = dataset_with_accession(db.clone()).await;
        let dataset = db.dataset(&accession).await.unwrap().unwrap();
        let mut tx = db.begin().await.unwrap();
        tx.insert_revision(NewRevision {
            dataset_id: dataset.id,
            revision: 4,
            revision_datetime: Utc::now(),
            task_id: "imported".to_string(),
            description: "imported".to_string(),
            file_sha256: "old".to_string(),
            repository_revision: None,
            status: RevisionStatus::Valid,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        // ACT
        let revision = RevisionAllocator::new(db.clone())
            .create_revision(&request(&accession, "new"))
            .await
            .unwrap();

        // ASSERT
        assert_eq!(revision.revision, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_revisions_have_no_gaps() {
        let db = database();
        let accession = dataset_with_accession(db.clone()).await;
        let allocator = Arc::new(RevisionAllocator::new(db.clone()));

        let mut handles = Vec::new();
        for i in 0..20 {
            let allocator = allocator.clone();
            let request = request(&accession, &format!("sha-{i}"));
            handles.push(tokio::spawn(async move {
                allocator.create_revision(&request).await.unwrap().revision
            }));
        }

        let mut revisions = Vec::new();
        for handle in handles {
            revisions.push(handle.await.unwrap());
        }
        revisions.sort();

        let unique: HashSet<i64> = revisions.iter().copied().collect();
        assert_eq!(unique.len(), 20);
        assert_eq!(revisions, (1..=20).collect::<Vec<i64>>());
        assert_eq!(db.dataset(&accession).await.unwrap().unwrap().revision, 20);
    }

    #[tokio::test]
    async fn test_lock_timeout_surfaces_as_store_error() {
        let db = Arc::new(MemoryDatabase::seeded(Duration::from_millis(30)));
        let mut holder = db.begin().await.unwrap();
        holder.identifier_for_update("mhd").await.unwrap();

        let err = IdentifierAllocator::new(db.clone())
            .allocate("mhd")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AllocationError::Store(StoreError::LockTimeout { .. })
        ));
        assert_eq!(err.kind(), "lock_timeout");
        holder.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_thread_task_status_visible_under_lock() {
        let registry = TaskRegistry::new();
        let task = registry.register("hub", "common", "tests.slow", slow).unwrap();
        let service = ThreadTaskService::new("hub", registry);
        let lock = lock(Arc::new(MemoryCache::new()), LockMode::CheckThenSet);

        let result = lock
            .start_guarded("op:r", &service, &task, None, Default::default(), None)
            .await
            .unwrap();

        assert_eq!(result.status().await.unwrap(), TaskStatus::Running);
        assert_eq!(
            lock.holder("op:r").await.unwrap().as_ref(),
            Some(result.task_id())
        );
    }
}
