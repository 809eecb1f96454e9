//! Tests for the sync module
//!
//! These tests verify:
//! - precondition handling (no identity / no document settles to idle)
//! - the forbidden-upsert fallback and full replace-all cycle
//! - debounce coalescing of edit bursts
//! - write/read round-trips through the remote boundary

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::session::{
        AuthApi, AuthError, MemorySessionStore, SessionManager, TokenPair,
    };
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Map, Value};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;
    use tokio::time::Duration;

    fn make_token(claims: serde_json::Value) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(b"test-secret"),
        )
        .expect("failed to encode token")
    }

    /// Auth endpoint that never refreshes; the session tests cover refresh.
    struct NoRefreshAuth;

    #[async_trait]
    impl AuthApi for NoRefreshAuth {
        fn is_configured(&self) -> bool {
            true
        }

        async fn request_otp(&self, _email: &str) -> Result<(), AuthError> {
            Ok(())
        }

        async fn exchange_refresh_token(
            &self,
            _refresh_token: &str,
        ) -> Result<TokenPair, AuthError> {
            Err(AuthError::Rejected("refresh disabled in tests".into()))
        }
    }

    async fn authed_session() -> SessionManager {
        let manager =
            SessionManager::new(Arc::new(MemorySessionStore::new()), Arc::new(NoRefreshAuth));
        let token = make_token(json!({
            "sub": "user-1",
            "email": "dev@example.com",
            "exp": Utc::now().timestamp() + 86_400,
        }));
        manager
            .initialize(Some(&format!("access_token={token}&refresh_token=rt")))
            .await;
        assert!(manager.is_authenticated());
        manager
    }

    async fn local_only_session() -> SessionManager {
        let manager =
            SessionManager::new(Arc::new(MemorySessionStore::new()), Arc::new(NoRefreshAuth));
        manager.initialize(None).await;
        manager
    }

    // ---- in-memory transport ----

    #[derive(Debug, Clone)]
    struct Call {
        method: &'static str,
        table: String,
        prefer: Option<String>,
        rows: usize,
    }

    #[derive(Default)]
    struct MockTransport {
        calls: Mutex<Vec<Call>>,
        tables: Mutex<HashMap<String, Vec<Value>>>,
        forbid_header_upsert: AtomicBool,
    }

    fn split_path(path: &str) -> (&str, &str) {
        match path.split_once('?') {
            Some((table, query)) => (table, query),
            None => (path, ""),
        }
    }

    fn eq_filters(query: &str) -> Vec<(&str, &str)> {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .filter_map(|(key, value)| value.strip_prefix("eq.").map(|v| (key, v)))
            .collect()
    }

    fn matches(row: &Value, filters: &[(&str, &str)]) -> bool {
        filters
            .iter()
            .all(|(key, value)| row.get(*key).and_then(Value::as_str) == Some(*value))
    }

    impl MockTransport {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn header_posts(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.method == "POST" && c.table == "diagrams")
                .count()
        }

        fn rows(&self, table: &str) -> Vec<Value> {
            self.tables
                .lock()
                .unwrap()
                .get(table)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl RestTransport for MockTransport {
        fn is_configured(&self) -> bool {
            true
        }

        async fn write(
            &self,
            path: &str,
            method: WriteMethod,
            body: Option<Value>,
            prefer: Option<&str>,
            _access_token: &str,
        ) -> Result<(), RemoteError> {
            let (table, query) = split_path(path);
            let rows = body
                .as_ref()
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            self.calls.lock().unwrap().push(Call {
                method: match method {
                    WriteMethod::Post => "POST",
                    WriteMethod::Delete => "DELETE",
                },
                table: table.to_string(),
                prefer: prefer.map(str::to_string),
                rows,
            });

            match method {
                WriteMethod::Post => {
                    // The plain upsert uses the default Prefer header; the
                    // fallback insert overrides it and is let through.
                    if table == "diagrams"
                        && prefer.is_none()
                        && self.forbid_header_upsert.load(Ordering::SeqCst)
                    {
                        return Err(RemoteError::Forbidden(
                            "permission denied for table diagrams".into(),
                        ));
                    }
                    let new_rows = body
                        .and_then(|b| b.as_array().cloned())
                        .unwrap_or_default();
                    let mut tables = self.tables.lock().unwrap();
                    let stored = tables.entry(table.to_string()).or_default();
                    for row in new_rows {
                        if let Some(id) = row.get("id").and_then(Value::as_str) {
                            let id = id.to_string();
                            stored.retain(|existing| {
                                existing.get("id").and_then(Value::as_str) != Some(id.as_str())
                            });
                        }
                        stored.push(row);
                    }
                }
                WriteMethod::Delete => {
                    let filters = eq_filters(query);
                    let mut tables = self.tables.lock().unwrap();
                    if let Some(stored) = tables.get_mut(table) {
                        stored.retain(|row| !matches(row, &filters));
                    }
                }
            }
            Ok(())
        }

        async fn read(&self, path: &str, _access_token: &str) -> Result<Value, RemoteError> {
            let (table, query) = split_path(path);
            let filters = eq_filters(query);
            let select: Option<Vec<&str>> = query
                .split('&')
                .find_map(|pair| pair.strip_prefix("select="))
                .map(|cols| cols.split(',').collect());

            let mut rows: Vec<Value> = self
                .rows(table)
                .into_iter()
                .filter(|row| matches(row, &filters))
                .collect();
            if query.contains("order=updated_at.desc") {
                rows.sort_by(|a, b| {
                    b.get("updated_at")
                        .and_then(Value::as_str)
                        .cmp(&a.get("updated_at").and_then(Value::as_str))
                });
            }
            if let Some(columns) = select {
                rows = rows
                    .into_iter()
                    .map(|row| {
                        let mut projected = Map::new();
                        for column in &columns {
                            projected.insert(
                                (*column).to_string(),
                                row.get(*column).cloned().unwrap_or(Value::Null),
                            );
                        }
                        Value::Object(projected)
                    })
                    .collect();
            }
            Ok(Value::Array(rows))
        }
    }

    // ---- fixtures ----

    fn entity(id: &str, label: &str) -> DiagramEntity {
        let mut data = Map::new();
        data.insert("name".to_string(), json!(label));
        DiagramEntity {
            id: id.to_string(),
            data,
        }
    }

    fn diagram(id: &str) -> Diagram {
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Diagram {
            id: id.to_string(),
            name: "orders".to_string(),
            database_type: DatabaseType::Postgresql,
            database_edition: None,
            created_at: created,
            updated_at: created,
            tables: Vec::new(),
            relationships: Vec::new(),
            dependencies: Vec::new(),
            areas: Vec::new(),
            custom_types: Vec::new(),
            notes: Vec::new(),
        }
    }

    fn all_tables() -> HashSet<&'static str> {
        EntityCollection::ALL.iter().map(|c| c.table()).collect()
    }

    // ---- preconditions ----

    #[tokio::test]
    async fn trigger_sync_without_identity_settles_idle() {
        let transport = Arc::new(MockTransport::default());
        let (_documents, feed) = watch::channel(Some(diagram("d1")));
        let orchestrator = SyncOrchestrator::new(
            local_only_session().await,
            CloudStore::new(transport.clone()),
            feed,
        );

        orchestrator.trigger_sync().await;

        assert_eq!(orchestrator.status(), SyncStatus::Idle);
        assert!(orchestrator.error().is_none());
        assert!(transport.calls().is_empty(), "no network activity expected");
    }

    #[tokio::test]
    async fn trigger_sync_without_document_settles_idle() {
        let transport = Arc::new(MockTransport::default());
        let (_documents, feed) = watch::channel(None);
        let orchestrator = SyncOrchestrator::new(
            authed_session().await,
            CloudStore::new(transport.clone()),
            feed,
        );

        orchestrator.trigger_sync().await;

        assert_eq!(orchestrator.status(), SyncStatus::Idle);
        assert!(transport.calls().is_empty());
    }

    // ---- full cycle ----

    #[tokio::test]
    async fn forbidden_upsert_falls_back_to_delete_insert() {
        let transport = Arc::new(MockTransport::default());
        transport.forbid_header_upsert.store(true, Ordering::SeqCst);

        let mut doc = diagram("d1");
        doc.tables = vec![entity("t1", "users"), entity("t2", "orders")];
        doc.notes = vec![entity("n1", "todo")];
        let (_documents, feed) = watch::channel(Some(doc));
        let orchestrator = SyncOrchestrator::new(
            authed_session().await,
            CloudStore::new(transport.clone()),
            feed,
        );

        orchestrator.trigger_sync().await;

        assert_eq!(orchestrator.status(), SyncStatus::Synced);
        assert!(orchestrator.error().is_none());

        let calls = transport.calls();
        // Rejected upsert, then delete+insert of the header row.
        assert_eq!((calls[0].method, calls[0].table.as_str()), ("POST", "diagrams"));
        assert_eq!(
            (calls[1].method, calls[1].table.as_str(), calls[1].prefer.as_deref()),
            ("DELETE", "diagrams", Some("return=minimal"))
        );
        assert_eq!(
            (calls[2].method, calls[2].table.as_str(), calls[2].prefer.as_deref()),
            ("POST", "diagrams", Some("return=minimal"))
        );
        // The cycle still clears all six collections afterwards.
        let deletes: HashSet<&str> = calls[3..9]
            .iter()
            .map(|call| {
                assert_eq!(call.method, "DELETE");
                call.table.as_str()
            })
            .collect();
        assert_eq!(deletes, all_tables());
        // And re-inserts only the populated ones.
        let posts: HashSet<&str> = calls[9..]
            .iter()
            .map(|call| {
                assert_eq!(call.method, "POST");
                assert!(call.rows > 0);
                call.table.as_str()
            })
            .collect();
        assert_eq!(posts, HashSet::from(["db_tables", "notes"]));

        assert_eq!(transport.rows("diagrams").len(), 1);
        assert_eq!(transport.rows("db_tables").len(), 2);
        assert_eq!(transport.rows("notes").len(), 1);
    }

    #[tokio::test]
    async fn empty_collections_produce_no_insert_calls() {
        let transport = Arc::new(MockTransport::default());
        let (_documents, feed) = watch::channel(Some(diagram("d1")));
        let orchestrator = SyncOrchestrator::new(
            authed_session().await,
            CloudStore::new(transport.clone()),
            feed,
        );

        orchestrator.trigger_sync().await;

        assert_eq!(orchestrator.status(), SyncStatus::Synced);
        assert!(orchestrator.last_synced_at().is_some());

        let calls = transport.calls();
        assert_eq!(transport.header_posts(), 1);
        let child_posts = calls
            .iter()
            .filter(|call| call.method == "POST" && call.table != "diagrams")
            .count();
        assert_eq!(child_posts, 0, "empty collections must not hit the network");
        let deletes: HashSet<&str> = calls
            .iter()
            .filter(|call| call.method == "DELETE")
            .map(|call| call.table.as_str())
            .collect();
        assert_eq!(deletes, all_tables());
    }

    #[tokio::test]
    async fn other_header_failures_surface_as_error() {
        struct RejectingTransport;

        #[async_trait]
        impl RestTransport for RejectingTransport {
            fn is_configured(&self) -> bool {
                true
            }

            async fn write(
                &self,
                _path: &str,
                _method: WriteMethod,
                _body: Option<Value>,
                _prefer: Option<&str>,
                _access_token: &str,
            ) -> Result<(), RemoteError> {
                Err(RemoteError::Rejected {
                    status: 500,
                    body: "relation \"diagrams\" does not exist".into(),
                })
            }

            async fn read(&self, _path: &str, _access_token: &str) -> Result<Value, RemoteError> {
                Ok(json!([]))
            }
        }

        let (_documents, feed) = watch::channel(Some(diagram("d1")));
        let orchestrator = SyncOrchestrator::new(
            authed_session().await,
            CloudStore::new(Arc::new(RejectingTransport)),
            feed,
        );

        orchestrator.trigger_sync().await;

        assert_eq!(orchestrator.status(), SyncStatus::Error);
        let message = orchestrator.error().expect("error message captured");
        assert!(message.contains("does not exist"));
    }

    // ---- debounce ----

    #[tokio::test(start_paused = true)]
    async fn burst_of_edits_coalesces_into_one_sync() {
        let transport = Arc::new(MockTransport::default());
        let (documents, feed) = watch::channel(None::<Diagram>);
        let orchestrator = SyncOrchestrator::new(
            authed_session().await,
            CloudStore::new(transport.clone()),
            feed,
        );
        let watcher = orchestrator.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;

        for edit in 0..3u32 {
            let mut doc = diagram("d1");
            doc.name = format!("orders-v{edit}");
            doc.updated_at = doc.created_at + chrono::Duration::seconds(i64::from(edit) + 1);
            documents.send(Some(doc)).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(orchestrator.status(), SyncStatus::Pending);
        assert_eq!(transport.header_posts(), 0, "debounce window still open");

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(transport.header_posts(), 1, "burst must coalesce into one attempt");
        assert_eq!(orchestrator.status(), SyncStatus::Synced);
        // The attempt that ran carries the trailing edit.
        let header = &transport.rows("diagrams")[0];
        assert_eq!(header.get("name").and_then(Value::as_str), Some("orders-v2"));

        watcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn losing_the_document_resets_to_idle_and_disarms_timer() {
        let transport = Arc::new(MockTransport::default());
        let (documents, feed) = watch::channel(None::<Diagram>);
        let orchestrator = SyncOrchestrator::new(
            authed_session().await,
            CloudStore::new(transport.clone()),
            feed,
        );
        let watcher = orchestrator.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;

        documents.send(Some(diagram("d1"))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(orchestrator.status(), SyncStatus::Pending);

        documents.send(None).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(orchestrator.status(), SyncStatus::Idle);
        assert_eq!(transport.header_posts(), 0, "disarmed timer must not fire");

        watcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_is_observed_on_the_next_document_tick() {
        let transport = Arc::new(MockTransport::default());
        let session = authed_session().await;
        let (documents, feed) = watch::channel(None::<Diagram>);
        let orchestrator = SyncOrchestrator::new(
            session.clone(),
            CloudStore::new(transport.clone()),
            feed,
        );
        let watcher = orchestrator.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;

        documents.send(Some(diagram("d1"))).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(orchestrator.status(), SyncStatus::Synced);

        // Authentication is sampled on feed ticks, so the published status
        // holds until the document changes again.
        session.sign_out().await;
        assert_eq!(orchestrator.status(), SyncStatus::Synced);

        let mut doc = diagram("d1");
        doc.updated_at = doc.created_at + chrono::Duration::seconds(5);
        documents.send(Some(doc)).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(orchestrator.status(), SyncStatus::Idle);
        assert_eq!(transport.header_posts(), 1, "signed-out edits must not sync");

        watcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn payload_only_change_is_not_a_qualifying_change() {
        let transport = Arc::new(MockTransport::default());
        let mut doc = diagram("d1");
        doc.tables = vec![entity("t1", "users")];
        let (documents, feed) = watch::channel(Some(doc.clone()));
        let orchestrator = SyncOrchestrator::new(
            authed_session().await,
            CloudStore::new(transport.clone()),
            feed,
        );
        let watcher = orchestrator.spawn();
        // The startup snapshot is itself a change; let its cycle finish.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.header_posts(), 1);

        // Same id, same updated_at, same entity ids: not qualifying.
        doc.tables[0].data.insert("name".to_string(), json!("customers"));
        documents.send(Some(doc.clone())).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.header_posts(), 1);

        // Bumping updated_at qualifies.
        doc.updated_at = doc.updated_at + chrono::Duration::seconds(1);
        documents.send(Some(doc)).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.header_posts(), 2);

        watcher.abort();
    }

    // ---- fingerprint ----

    #[test]
    fn fingerprint_tracks_id_timestamp_and_collection_identity() {
        let mut doc = diagram("d1");
        doc.tables = vec![entity("t1", "users")];
        let base = DocumentFingerprint::of(&doc);

        assert_eq!(DocumentFingerprint::of(&doc), base);

        let mut renamed = doc.clone();
        renamed.tables[0].data.insert("name".to_string(), json!("accounts"));
        assert_eq!(
            DocumentFingerprint::of(&renamed),
            base,
            "payload-only edits are invisible to the fingerprint"
        );

        let mut touched = doc.clone();
        touched.updated_at = touched.updated_at + chrono::Duration::seconds(1);
        assert_ne!(DocumentFingerprint::of(&touched), base);

        let mut grown = doc.clone();
        grown.notes.push(entity("n1", "todo"));
        assert_ne!(DocumentFingerprint::of(&grown), base);

        let mut relabeled = doc;
        relabeled.id = "d2".to_string();
        assert_ne!(DocumentFingerprint::of(&relabeled), base);
    }

    // ---- round trip & delete ----

    #[tokio::test]
    async fn round_trip_preserves_header_and_entities() {
        let transport = Arc::new(MockTransport::default());
        let mut doc = diagram("d1");
        doc.database_edition = Some("supabase".to_string());
        doc.tables = vec![entity("t1", "users"), entity("t2", "orders")];
        doc.relationships = vec![entity("r1", "users_orders")];
        doc.notes = vec![entity("n1", "todo")];

        let (_documents, feed) = watch::channel(Some(doc.clone()));
        let orchestrator = SyncOrchestrator::new(
            authed_session().await,
            CloudStore::new(transport.clone()),
            feed,
        );

        orchestrator.trigger_sync().await;
        assert_eq!(orchestrator.status(), SyncStatus::Synced);

        let mut fetched = orchestrator.fetch_diagrams().await.expect("fetch succeeds");
        assert_eq!(fetched.len(), 1);
        let mut fetched = fetched.remove(0);

        assert_eq!(fetched.id, doc.id);
        assert_eq!(fetched.name, doc.name);
        assert_eq!(fetched.database_type, doc.database_type);
        assert_eq!(fetched.database_edition, doc.database_edition);
        assert_eq!(fetched.created_at, doc.created_at);
        assert_eq!(fetched.updated_at, doc.updated_at);

        // Membership and payload must match; order is not guaranteed.
        for collection in [&mut fetched.tables, &mut fetched.relationships, &mut fetched.notes] {
            collection.sort_by(|a, b| a.id.cmp(&b.id));
        }
        assert_eq!(fetched.tables, doc.tables);
        assert_eq!(fetched.relationships, doc.relationships);
        assert_eq!(fetched.notes, doc.notes);
        assert!(fetched.dependencies.is_empty());
        assert!(fetched.areas.is_empty());
        assert!(fetched.custom_types.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_children_and_header() {
        let transport = Arc::new(MockTransport::default());
        let mut doc = diagram("d1");
        doc.tables = vec![entity("t1", "users")];
        let (_documents, feed) = watch::channel(Some(doc));
        let orchestrator = SyncOrchestrator::new(
            authed_session().await,
            CloudStore::new(transport.clone()),
            feed,
        );

        orchestrator.trigger_sync().await;
        assert_eq!(transport.rows("diagrams").len(), 1);
        assert_eq!(transport.rows("db_tables").len(), 1);

        orchestrator
            .delete_diagram_from_cloud("d1")
            .await
            .expect("delete succeeds");

        assert!(transport.rows("diagrams").is_empty());
        assert!(transport.rows("db_tables").is_empty());
    }

    #[tokio::test]
    async fn delete_without_session_is_a_no_op() {
        let transport = Arc::new(MockTransport::default());
        let (_documents, feed) = watch::channel(None);
        let orchestrator = SyncOrchestrator::new(
            local_only_session().await,
            CloudStore::new(transport.clone()),
            feed,
        );

        orchestrator
            .delete_diagram_from_cloud("d1")
            .await
            .expect("no-op delete succeeds");

        assert!(transport.calls().is_empty());
    }
}
