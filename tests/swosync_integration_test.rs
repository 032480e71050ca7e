// ABOUTME: Integration tests for switchover sync against live PostgreSQL databases
// ABOUTME: Covers convergence, idempotence, sequences, deletes, locks, timeouts and cutover

use pg_switchover::config::{SwitchoverConfig, TableConfig};
use pg_switchover::swosync::{LogicalReplicator, SwitchoverPhase, SyncError, SyncPhase};
use std::env;
use std::time::Duration;
use tokio_postgres::Client;

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let source = env::var("TEST_SOURCE_URL").ok()?;
    let target = env::var("TEST_TARGET_URL").ok()?;
    Some((source, target))
}

/// Per-test objects, prefixed so tests can run concurrently.
struct Fixture {
    source: Client,
    target: Client,
    config: SwitchoverConfig,
    prefix: String,
}

impl Fixture {
    fn customers(&self) -> String {
        format!("{}_customers", self.prefix)
    }

    fn orders(&self) -> String {
        format!("{}_orders", self.prefix)
    }

    fn sequence(&self) -> String {
        format!("{}_ticket_seq", self.prefix)
    }

    fn change_log(&self) -> String {
        format!("{}_change_log", self.prefix)
    }

    fn state_table(&self) -> String {
        format!("{}_state", self.prefix)
    }

    async fn replicator(&self) -> LogicalReplicator {
        LogicalReplicator::connect(&self.config)
            .await
            .expect("Failed to connect replicator")
    }

    async fn set_state(&self, state: SwitchoverPhase) {
        self.source
            .execute(
                &format!("UPDATE {} SET current_state = $1", self.state_table()),
                &[&state.as_str()],
            )
            .await
            .unwrap();
    }

    async fn current_state(&self) -> String {
        self.source
            .query_one(&format!("SELECT current_state FROM {}", self.state_table()), &[])
            .await
            .unwrap()
            .get(0)
    }

    async fn change_log_len(&self) -> i64 {
        self.source
            .query_one(&format!("SELECT count(*) FROM {}", self.change_log()), &[])
            .await
            .unwrap()
            .get(0)
    }

    async fn customer_rows(&self, client: &Client) -> Vec<(i64, String)> {
        client
            .query(
                &format!("SELECT id, name FROM {} ORDER BY id", self.customers()),
                &[],
            )
            .await
            .unwrap()
            .iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect()
    }

    async fn order_rows(&self, client: &Client) -> Vec<(i64, i64, i32)> {
        client
            .query(
                &format!(
                    "SELECT id, customer_id, amount FROM {} ORDER BY id",
                    self.orders()
                ),
                &[],
            )
            .await
            .unwrap()
            .iter()
            .map(|row| (row.get(0), row.get(1), row.get(2)))
            .collect()
    }

    async fn cleanup(&self) {
        let drop_tables = format!(
            "DROP TABLE IF EXISTS {o}, {c}, {l}, {s} CASCADE; \
             DROP SEQUENCE IF EXISTS {q}; \
             DROP FUNCTION IF EXISTS {p}_capture() CASCADE; \
             DROP FUNCTION IF EXISTS {p}_freeze() CASCADE;",
            o = self.orders(),
            c = self.customers(),
            l = self.change_log(),
            s = self.state_table(),
            q = self.sequence(),
            p = self.prefix
        );
        let _ = self.source.batch_execute(&drop_tables).await;
        let _ = self.target.batch_execute(&drop_tables).await;
    }
}

/// Create the tracked schema on both databases, capture triggers on the
/// source, and an `in_progress` switchover row.
async fn setup(suffix: &str, lock_base: i64) -> Fixture {
    let (source_url, target_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");

    let source = pg_switchover::postgres::connect(&source_url)
        .await
        .expect("Failed to connect to source");
    let target = pg_switchover::postgres::connect(&target_url)
        .await
        .expect("Failed to connect to target");

    let prefix = format!("swo_test_{}", suffix);
    let fixture = Fixture {
        source,
        target,
        config: SwitchoverConfig {
            source_url: Some(source_url),
            target_url: Some(target_url),
            change_log_table: format!("{}_change_log", prefix),
            switchover_table: format!("{}_state", prefix),
            sync_lock_key: lock_base,
            stop_the_world_lock_key: lock_base + 1,
            sequences: vec![format!("{}_ticket_seq", prefix)],
            tables: vec![
                // Ranks derived from the foreign key
                TableConfig {
                    name: format!("{}_orders", prefix),
                    primary_key: None,
                    rank: None,
                },
                TableConfig {
                    name: format!("{}_customers", prefix),
                    primary_key: None,
                    rank: None,
                },
            ],
            ..SwitchoverConfig::default()
        },
        prefix,
    };
    fixture.cleanup().await;

    let tables = format!(
        r#"
        CREATE TABLE {c} (
            id BIGINT PRIMARY KEY,
            name TEXT NOT NULL
        );
        CREATE TABLE {o} (
            id BIGINT PRIMARY KEY,
            customer_id BIGINT NOT NULL REFERENCES {c} (id) DEFERRABLE,
            amount INTEGER NOT NULL DEFAULT 0
        );
        CREATE SEQUENCE {q};
        "#,
        c = fixture.customers(),
        o = fixture.orders(),
        q = fixture.sequence()
    );
    fixture.source.batch_execute(&tables).await.unwrap();
    fixture.target.batch_execute(&tables).await.unwrap();

    let capture = format!(
        r#"
        CREATE TABLE {l} (
            id BIGSERIAL PRIMARY KEY,
            table_name TEXT NOT NULL,
            row_id TEXT NOT NULL
        );
        CREATE TABLE {s} (
            ok BOOLEAN NOT NULL,
            current_state TEXT NOT NULL,
            db_id UUID NOT NULL
        );
        INSERT INTO {s} VALUES (true, 'in_progress', '00000000-0000-0000-0000-000000000001');
        CREATE FUNCTION {p}_capture() RETURNS trigger LANGUAGE plpgsql AS $$
        BEGIN
            IF TG_OP = 'DELETE' THEN
                INSERT INTO {l} (table_name, row_id) VALUES (TG_TABLE_NAME, OLD.id::text);
                RETURN OLD;
            END IF;
            INSERT INTO {l} (table_name, row_id) VALUES (TG_TABLE_NAME, NEW.id::text);
            RETURN NEW;
        END
        $$;
        CREATE TRIGGER {p}_capture_c AFTER INSERT OR UPDATE OR DELETE ON {c}
            FOR EACH ROW EXECUTE FUNCTION {p}_capture();
        CREATE TRIGGER {p}_capture_o AFTER INSERT OR UPDATE OR DELETE ON {o}
            FOR EACH ROW EXECUTE FUNCTION {p}_capture();
        "#,
        l = fixture.change_log(),
        s = fixture.state_table(),
        p = fixture.prefix,
        c = fixture.customers(),
        o = fixture.orders()
    );
    fixture.source.batch_execute(&capture).await.unwrap();

    fixture
}

/// Test: rows written on the source converge on the target and are pruned
#[tokio::test]
#[ignore]
async fn test_incremental_sync_converges() {
    let fx = setup("converge", 880_100).await;

    fx.source
        .batch_execute(&format!(
            "INSERT INTO {c} VALUES (1, 'acme'), (2, 'globex'); \
             INSERT INTO {o} VALUES (10, 1, 100), (11, 2, 250); \
             UPDATE {o} SET amount = 150 WHERE id = 10;",
            c = fx.customers(),
            o = fx.orders()
        ))
        .await
        .unwrap();

    let mut replicator = fx.replicator().await;
    // Parents first regardless of config order
    assert_eq!(replicator.tables()[0].name, fx.customers());
    assert_eq!(replicator.tables()[0].rank, 0);
    assert_eq!(replicator.tables()[1].rank, 1);

    let stats = replicator.incremental_sync().await.unwrap();
    assert_eq!(stats.change_entries, 5);
    assert_eq!(stats.rows_upserted, 4);
    assert_eq!(stats.rows_deleted, 0);
    assert_eq!(stats.pruned, Some(5));

    assert_eq!(
        fx.customer_rows(&fx.target).await,
        fx.customer_rows(&fx.source).await
    );
    assert_eq!(
        fx.order_rows(&fx.target).await,
        vec![(10, 1, 150), (11, 2, 250)]
    );
    assert_eq!(fx.change_log_len().await, 0);

    fx.cleanup().await;
}

/// Test: a second pass with nothing new changes nothing
#[tokio::test]
#[ignore]
async fn test_incremental_sync_is_idempotent() {
    let fx = setup("idempotent", 880_200).await;

    fx.source
        .batch_execute(&format!("INSERT INTO {} VALUES (1, 'acme')", fx.customers()))
        .await
        .unwrap();

    let mut replicator = fx.replicator().await;
    replicator.incremental_sync().await.unwrap();
    let before = fx.customer_rows(&fx.target).await;

    let stats = replicator.incremental_sync().await.unwrap();
    assert_eq!(stats.change_entries, 0);
    assert_eq!(stats.rows_upserted, 0);
    assert_eq!(fx.customer_rows(&fx.target).await, before);

    fx.cleanup().await;
}

/// Test: source deletes remove the row on the target, children first
#[tokio::test]
#[ignore]
async fn test_deleted_rows_are_removed() {
    let fx = setup("delete", 880_300).await;

    fx.source
        .batch_execute(&format!(
            "INSERT INTO {c} VALUES (1, 'acme'), (2, 'globex'); \
             INSERT INTO {o} VALUES (10, 2, 5);",
            c = fx.customers(),
            o = fx.orders()
        ))
        .await
        .unwrap();

    let mut replicator = fx.replicator().await;
    replicator.incremental_sync().await.unwrap();

    fx.source
        .batch_execute(&format!(
            "DELETE FROM {o} WHERE id = 10; DELETE FROM {c} WHERE id = 2;",
            c = fx.customers(),
            o = fx.orders()
        ))
        .await
        .unwrap();

    let stats = replicator.incremental_sync().await.unwrap();
    assert_eq!(stats.rows_deleted, 2);
    assert_eq!(fx.customer_rows(&fx.target).await, vec![(1, "acme".to_string())]);
    assert!(fx.order_rows(&fx.target).await.is_empty());

    fx.cleanup().await;
}

/// Test: rows inserted and deleted between passes produce a no-op delete
#[tokio::test]
#[ignore]
async fn test_insert_then_delete_between_passes() {
    let fx = setup("transient", 880_400).await;

    fx.source
        .batch_execute(&format!(
            "INSERT INTO {c} VALUES (7, 'temp'); DELETE FROM {c} WHERE id = 7;",
            c = fx.customers()
        ))
        .await
        .unwrap();

    let mut replicator = fx.replicator().await;
    let stats = replicator.incremental_sync().await.unwrap();
    assert_eq!(stats.change_entries, 2);
    assert_eq!(stats.rows_upserted, 0);
    assert_eq!(stats.rows_deleted, 1);
    assert!(fx.customer_rows(&fx.target).await.is_empty());

    fx.cleanup().await;
}

/// Test: target sequences advance to the source but never move backward
#[tokio::test]
#[ignore]
async fn test_sequences_only_move_forward() {
    let fx = setup("sequences", 880_500).await;

    fx.source
        .batch_execute(&format!(
            "SELECT nextval('{q}'), nextval('{q}'), nextval('{q}')",
            q = fx.sequence()
        ))
        .await
        .unwrap();

    let mut replicator = fx.replicator().await;
    let stats = replicator.incremental_sync().await.unwrap();
    assert_eq!(stats.sequences_advanced, 1);

    let last: i64 = fx
        .target
        .query_one(&format!("SELECT last_value FROM {}", fx.sequence()), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(last, 3);

    // Target ahead of source stays put
    fx.target
        .batch_execute(&format!("SELECT setval('{}', 1000)", fx.sequence()))
        .await
        .unwrap();
    let stats = replicator.incremental_sync().await.unwrap();
    assert_eq!(stats.sequences_advanced, 0);

    let last: i64 = fx
        .target
        .query_one(&format!("SELECT last_value FROM {}", fx.sequence()), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(last, 1000);

    fx.cleanup().await;
}

/// Test: a pass is rejected while another holds the sync lock
#[tokio::test]
#[ignore]
async fn test_concurrent_pass_is_rejected() {
    let mut fx = setup("lock", 880_600).await;

    let holder = fx.source.transaction().await.unwrap();
    holder
        .execute("SELECT pg_advisory_xact_lock($1)", &[&880_600i64])
        .await
        .unwrap();

    let mut replicator = LogicalReplicator::connect(&fx.config).await.unwrap();
    let err = replicator.incremental_sync().await.unwrap_err();
    assert_eq!(err.sync_phase(), SyncPhase::Begin);
    assert!(!err.is_fatal());

    holder.rollback().await.unwrap();
    replicator.incremental_sync().await.unwrap();

    fx.cleanup().await;
}

/// Test: incremental sync outside a switchover is a retryable error
#[tokio::test]
#[ignore]
async fn test_incremental_sync_requires_in_progress() {
    let fx = setup("idle", 880_700).await;
    fx.set_state(SwitchoverPhase::Idle).await;

    let mut replicator = fx.replicator().await;
    let err = replicator.incremental_sync().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::NotInProgress {
            state: SwitchoverPhase::Idle,
            fatal: false
        }
    ));

    fx.cleanup().await;
}

/// Test: final sync while idle is fatal and leaves the state untouched
#[tokio::test]
#[ignore]
async fn test_final_sync_while_idle_is_fatal() {
    let fx = setup("final_idle", 880_800).await;
    fx.set_state(SwitchoverPhase::Idle).await;
    fx.source
        .batch_execute(&format!("INSERT INTO {} VALUES (1, 'acme')", fx.customers()))
        .await
        .unwrap();

    let mut replicator = fx.replicator().await;
    let err = replicator.final_sync().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(fx.current_state().await, "idle");
    assert!(fx.customer_rows(&fx.target).await.is_empty());
    assert_eq!(fx.change_log_len().await, 1);

    fx.cleanup().await;
}

/// Test: final sync replays the last delta and flips the switchover state
#[tokio::test]
#[ignore]
async fn test_final_sync_cuts_over() {
    let fx = setup("cutover", 880_900).await;

    fx.source
        .batch_execute(&format!(
            "INSERT INTO {c} VALUES (1, 'acme'); INSERT INTO {o} VALUES (10, 1, 99);",
            c = fx.customers(),
            o = fx.orders()
        ))
        .await
        .unwrap();

    let mut replicator = fx.replicator().await;
    replicator.incremental_sync().await.unwrap();

    fx.source
        .batch_execute(&format!(
            "UPDATE {c} SET name = 'acme corp' WHERE id = 1",
            c = fx.customers()
        ))
        .await
        .unwrap();

    let stats = replicator.final_sync().await.unwrap();
    assert_eq!(stats.rows_upserted, 1);
    assert_eq!(fx.current_state().await, "use_next_db");
    assert_eq!(
        fx.customer_rows(&fx.target).await,
        vec![(1, "acme corp".to_string())]
    );

    // Exactly once: a repeat sees use_next_db and refuses
    let err = replicator.final_sync().await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        SyncError::NotInProgress {
            state: SwitchoverPhase::UseNextDb,
            ..
        }
    ));

    fx.cleanup().await;
}

/// Test: status helpers report state and pending counts
#[tokio::test]
#[ignore]
async fn test_status_reports_pending_changes() {
    let fx = setup("status", 881_000).await;

    fx.source
        .batch_execute(&format!(
            "INSERT INTO {c} VALUES (1, 'a'), (2, 'b'); UPDATE {c} SET name = 'c' WHERE id = 1;",
            c = fx.customers()
        ))
        .await
        .unwrap();

    let replicator = fx.replicator().await;
    let state = replicator.switchover_state().await.unwrap();
    assert_eq!(state.current_state, SwitchoverPhase::InProgress);
    assert!(state.ok);

    let pending = replicator.pending_changes().await.unwrap();
    assert_eq!(
        pending,
        vec![(fx.customers(), 3), (fx.orders(), 0)]
    );

    fx.cleanup().await;
}

/// Helper to open an extra source session outside the fixture
async fn connect_source() -> Client {
    let (source_url, _) = get_test_urls().expect("TEST_SOURCE_URL must be set");
    pg_switchover::postgres::connect(&source_url)
        .await
        .expect("Failed to connect to source")
}

/// Test: a change-log key spelled differently from the stored key still upserts
#[tokio::test]
#[ignore]
async fn test_row_id_text_variant_is_not_deleted() {
    let fx = setup("key_text", 881_100).await;

    fx.source
        .batch_execute(&format!(
            "INSERT INTO {c} VALUES (5, 'acme'); \
             INSERT INTO {l} (table_name, row_id) VALUES ('{c}', '05');",
            c = fx.customers(),
            l = fx.change_log()
        ))
        .await
        .unwrap();

    let mut replicator = fx.replicator().await;
    let stats = replicator.incremental_sync().await.unwrap();
    assert_eq!(stats.rows_deleted, 0);
    assert_eq!(stats.rows_upserted, 2);
    assert_eq!(fx.customer_rows(&fx.target).await, vec![(5, "acme".to_string())]);

    fx.cleanup().await;
}

/// Test: final sync includes a write committed by a writer it had to wait for
#[tokio::test]
#[ignore]
async fn test_final_sync_includes_writer_committed_while_waiting() {
    let fx = setup("late_writer", 881_200).await;

    fx.source
        .batch_execute(&format!("INSERT INTO {} VALUES (1, 'acme')", fx.customers()))
        .await
        .unwrap();
    let mut replicator = fx.replicator().await;
    replicator.incremental_sync().await.unwrap();

    let mut writer = connect_source().await;
    let customers = fx.customers();
    let stop_key = fx.config.stop_the_world_lock_key;
    let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
    let writer_task = tokio::spawn(async move {
        let tx = writer.transaction().await.unwrap();
        tx.execute("SELECT pg_advisory_xact_lock_shared($1)", &[&stop_key])
            .await
            .unwrap();
        let _ = locked_tx.send(());
        tokio::time::sleep(Duration::from_millis(700)).await;
        tx.execute(
            &format!("UPDATE {} SET name = 'late write' WHERE id = 1", customers),
            &[],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    });
    locked_rx.await.unwrap();

    let stats = replicator.final_sync().await.unwrap();
    writer_task.await.unwrap();

    assert_eq!(stats.rows_upserted, 1);
    assert_eq!(fx.current_state().await, "use_next_db");
    assert_eq!(
        fx.customer_rows(&fx.target).await,
        vec![(1, "late write".to_string())]
    );

    fx.cleanup().await;
}

/// Test: giving up on the stop-the-world lock is retryable and cuts nothing over
#[tokio::test]
#[ignore]
async fn test_final_sync_lock_wait_timeout_is_not_fatal() {
    let mut fx = setup("stw_wait", 881_300).await;
    fx.config.lock_timeout_ms = 200;

    let mut writer = connect_source().await;
    let tx = writer.transaction().await.unwrap();
    tx.execute(
        "SELECT pg_advisory_xact_lock_shared($1)",
        &[&fx.config.stop_the_world_lock_key],
    )
    .await
    .unwrap();

    let mut replicator = fx.replicator().await;
    let err = replicator.final_sync().await.unwrap_err();
    assert_eq!(err.sync_phase(), SyncPhase::Begin);
    assert!(!err.is_fatal());
    assert_eq!(fx.current_state().await, "in_progress");

    tx.rollback().await.unwrap();
    replicator.final_sync().await.unwrap();
    assert_eq!(fx.current_state().await, "use_next_db");

    fx.cleanup().await;
}

/// Test: a pass past its deadline leaves no open transaction and commits nothing
#[tokio::test]
#[ignore]
async fn test_pass_timeout_rolls_back() {
    let mut fx = setup("timeout", 881_400).await;
    fx.config.pass_timeout_secs = 1;
    fx.source
        .batch_execute(&format!("INSERT INTO {} VALUES (1, 'acme')", fx.customers()))
        .await
        .unwrap();
    let mut replicator = fx.replicator().await;

    let mut holder = connect_source().await;
    let tx = holder.transaction().await.unwrap();
    tx.batch_execute(&format!(
        "LOCK TABLE {} IN ACCESS EXCLUSIVE MODE",
        fx.change_log()
    ))
    .await
    .unwrap();

    let err = replicator.incremental_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Timeout { fatal: false, .. }));

    // The pass's session must be out of its transaction while the blocking
    // lock is still held: no waiter, no leftover sync lock, not idle in tx.
    let monitor = connect_source().await;
    let mut settled = false;
    for _ in 0..50 {
        let row = monitor
            .query_one(
                "SELECT
                   (SELECT count(*) FROM pg_locks
                     WHERE relation = $1::text::regclass AND NOT granted),
                   (SELECT count(*) FROM pg_stat_activity a
                     WHERE a.application_name = 'pg-switchover'
                       AND a.state LIKE 'idle in transaction%'
                       AND EXISTS (SELECT 1 FROM pg_locks l
                                    WHERE l.pid = a.pid AND l.locktype = 'advisory'
                                      AND l.objid::text::bigint = $2 AND l.objsubid = 1))",
                &[&fx.change_log(), &fx.config.sync_lock_key],
            )
            .await
            .unwrap();
        let (waiting, idle_in_tx): (i64, i64) = (row.get(0), row.get(1));
        if waiting == 0 && idle_in_tx == 0 {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(settled, "sync pass left a transaction open after timing out");

    tx.rollback().await.unwrap();
    assert!(fx.customer_rows(&fx.target).await.is_empty());
    assert_eq!(fx.change_log_len().await, 1);

    // The connection is still usable for the next pass.
    let stats = replicator.incremental_sync().await.unwrap();
    assert_eq!(stats.rows_upserted, 1);

    fx.cleanup().await;
}

/// Test: a cutover write that matches no row is fatal and rolls the source back
#[tokio::test]
#[ignore]
async fn test_final_sync_state_conflict_rolls_back() {
    let fx = setup("conflict", 881_500).await;

    // Swallow every update of the state row so the cutover matches zero rows
    fx.source
        .batch_execute(&format!(
            r#"
            INSERT INTO {c} VALUES (1, 'acme');
            CREATE FUNCTION {p}_freeze() RETURNS trigger LANGUAGE plpgsql AS $$
            BEGIN
                RETURN NULL;
            END
            $$;
            CREATE TRIGGER {p}_freeze BEFORE UPDATE ON {s}
                FOR EACH ROW EXECUTE FUNCTION {p}_freeze();
            "#,
            c = fx.customers(),
            p = fx.prefix,
            s = fx.state_table()
        ))
        .await
        .unwrap();

    let mut replicator = fx.replicator().await;
    let err = replicator.final_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::StateConflict));
    assert!(err.is_fatal());
    assert_eq!(err.sync_phase(), SyncPhase::StateTransition);

    assert_eq!(fx.current_state().await, "in_progress");
    // Source rolled back: nothing pruned
    assert_eq!(fx.change_log_len().await, 1);

    // Writers are not left blocked
    let free: bool = fx
        .source
        .query_one(
            "SELECT pg_try_advisory_lock($1)",
            &[&fx.config.stop_the_world_lock_key],
        )
        .await
        .unwrap()
        .get(0);
    assert!(free);
    fx.source
        .execute(
            "SELECT pg_advisory_unlock($1)",
            &[&fx.config.stop_the_world_lock_key],
        )
        .await
        .unwrap();

    fx.cleanup().await;
}
