#[cfg(test)]
mod tests {
    use crate::app::AppContext;
    use crate::config::{BackendKind, DatabaseKind, Settings};
    use crate::executor::{AsyncTaskService, TaskOutcome, TaskParams};
    use crate::tasks::{RevisionModel, submit_revision};

    use serde_json::json;
    use std::time::Duration;

    fn fast_settings(backend: BackendKind) -> Settings {
        let mut settings = Settings::default();
        settings.executor.backend = backend;
        settings.executor.poll_interval_ms = 10;
        settings.worker.idle_sleep_ms = 10;
        settings
    }

    fn announcement() -> serde_json::Value {
        json!({
            "$schema": "https://example.org/announcement.json",
            "profile_uri": "https://example.org/profile.json",
            "repository_name": "Repository One",
            "mhd_identifier": "MHDA000001",
            "repository_identifier": "ST000001",
        })
    }

    #[tokio::test]
    async fn test_queue_node_runs_a_submission_end_to_end() {
        // ARRANGE
        let ctx = AppContext::build(fast_settings(BackendKind::Queue))
            .await
            .unwrap();
        assert!(ctx.needs_local_workers());
        assert!(ctx.start_workers().is_some());
        let dataset = ctx
            .identifiers
            .assign_dataset("mhd", "repo-1", "ST000001")
            .await
            .unwrap();

        // ACT
        let submission = submit_revision(
            &ctx.service,
            &ctx.lock,
            &ctx.catalog,
            "repo-1",
            &dataset.accession,
            announcement(),
            "initial",
        )
        .await
        .unwrap();
        let outcome: TaskOutcome<RevisionModel> = ctx
            .service
            .get_result(&submission.task_id)
            .await
            .unwrap()
            .outcome(Some(Duration::from_secs(10)))
            .await;
        ctx.shutdown().await;

        // ASSERT
        assert_eq!(dataset.accession, "MHDA000001");
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.result.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_start_workers_is_idempotent() {
        let ctx = AppContext::build(fast_settings(BackendKind::Queue))
            .await
            .unwrap();

        let first = ctx.start_workers().unwrap();
        let second = ctx.start_workers().unwrap();
        assert!(std::sync::Arc::ptr_eq(&first, &second));

        ctx.shutdown().await;
        assert!(first.is_shut_down());
    }

    #[tokio::test]
    async fn test_thread_node_has_no_worker_pool() {
        let ctx = AppContext::build(fast_settings(BackendKind::Thread))
            .await
            .unwrap();

        assert_eq!(ctx.service.kind(), "thread");
        assert!(!ctx.needs_local_workers());
        assert!(ctx.start_workers().is_none());
        assert!(ctx.registry.is_sealed());
    }

    #[tokio::test]
    async fn test_configured_app_name_reaches_the_registry() {
        // ARRANGE
        let mut settings = fast_settings(BackendKind::Queue);
        settings.app.name = "metabolights".to_string();
        let ctx = AppContext::build(settings).await.unwrap();
        ctx.start_workers();

        // ACT
        let result = ctx
            .service
            .get_executor(&ctx.catalog.ping, None, TaskParams::new())
            .unwrap()
            .start(None)
            .await
            .unwrap();
        let outcome: TaskOutcome<serde_json::Value> =
            result.outcome(Some(Duration::from_secs(10))).await;
        ctx.shutdown().await;

        // ASSERT
        assert_eq!(ctx.service.app_name(), "metabolights");
        assert_eq!(ctx.catalog.ping.app_name(), "metabolights");
        assert_eq!(ctx.registry.tasks_for("metabolights").len(), 4);
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.result.unwrap()["reply"], "pong");
    }

    #[tokio::test]
    async fn test_configured_prefixes_are_created() {
        let mut settings = fast_settings(BackendKind::Thread);
        settings.database.identifier_prefixes.push("extra".to_string());

        let ctx = AppContext::build(settings).await.unwrap();

        assert_eq!(ctx.identifiers.allocate("extra").await.unwrap(), "extra000001");
        assert_eq!(ctx.identifiers.allocate("mhd").await.unwrap(), "MHDA000001");
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_sqlite_node_keeps_accessions_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = fast_settings(BackendKind::Thread);
        settings.database.kind = DatabaseKind::Sqlite;
        settings.database.path = Some(dir.path().join("hub.db"));

        let first = AppContext::build(settings.clone()).await.unwrap();
        assert_eq!(first.identifiers.allocate("mhd").await.unwrap(), "MHDA000001");
        drop(first);

        let second = AppContext::build(settings).await.unwrap();
        assert_eq!(second.identifiers.allocate("mhd").await.unwrap(), "MHDA000002");
    }

    #[tokio::test]
    async fn test_invalid_settings_are_refused() {
        let mut settings = Settings::default();
        settings.worker.concurrency = 0;

        assert!(AppContext::build(settings).await.is_err());
    }
}
