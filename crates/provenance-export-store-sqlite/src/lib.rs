#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use provenance_export_core::{
    clean_relative_path, format_rfc3339, now_utc, parse_rfc3339_utc, Activity, ActivityGateway,
    ActivityId, ActivityInput, CommandParameter, ExportError, ParameterValue, Plan, PlanId,
};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use ulid::Ulid;

const ACTIVITY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_ACTIVITY_V1: &str = r"
CREATE TABLE IF NOT EXISTS plans (
  plan_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  command TEXT NOT NULL,
  description TEXT,
  parameters_json TEXT NOT NULL DEFAULT '[]',
  success_codes_json TEXT NOT NULL DEFAULT '[0]',
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS activities (
  activity_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  activity_id TEXT NOT NULL UNIQUE,
  plan_id TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (plan_id) REFERENCES plans(plan_id)
);

CREATE TABLE IF NOT EXISTS activity_usages (
  activity_id TEXT NOT NULL,
  ordinal INTEGER NOT NULL,
  path TEXT NOT NULL,
  PRIMARY KEY (activity_id, ordinal),
  FOREIGN KEY (activity_id) REFERENCES activities(activity_id)
);

CREATE TABLE IF NOT EXISTS activity_generations (
  activity_id TEXT NOT NULL,
  ordinal INTEGER NOT NULL,
  path TEXT NOT NULL,
  PRIMARY KEY (activity_id, ordinal),
  FOREIGN KEY (activity_id) REFERENCES activities(activity_id)
);

CREATE TABLE IF NOT EXISTS activity_parameter_values (
  activity_id TEXT NOT NULL,
  parameter_name TEXT NOT NULL,
  value TEXT NOT NULL,
  PRIMARY KEY (activity_id, parameter_name),
  FOREIGN KEY (activity_id) REFERENCES activities(activity_id)
);

CREATE TRIGGER IF NOT EXISTS trg_activities_no_update
BEFORE UPDATE ON activities
BEGIN
  SELECT RAISE(FAIL, 'activities is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_activities_no_delete
BEFORE DELETE ON activities
BEGIN
  SELECT RAISE(FAIL, 'activities is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_activity_usages_no_update
BEFORE UPDATE ON activity_usages
BEGIN
  SELECT RAISE(FAIL, 'activity_usages is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_activity_generations_no_update
BEFORE UPDATE ON activity_generations
BEGIN
  SELECT RAISE(FAIL, 'activity_generations is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_activity_generations_path
  ON activity_generations(path);
CREATE INDEX IF NOT EXISTS idx_activity_usages_path
  ON activity_usages(path);
";

const REQUIRED_TABLES: &[(&str, &[&str])] = &[
    (
        "plans",
        &[
            "plan_id",
            "name",
            "command",
            "description",
            "parameters_json",
            "success_codes_json",
        ],
    ),
    (
        "activities",
        &[
            "activity_seq",
            "activity_id",
            "plan_id",
            "started_at",
            "ended_at",
        ],
    ),
    ("activity_usages", &["activity_id", "ordinal", "path"]),
    ("activity_generations", &["activity_id", "ordinal", "path"]),
    (
        "activity_parameter_values",
        &["activity_id", "parameter_name", "value"],
    ),
];

/// Activity history persisted in `SQLite`.
pub struct SqliteActivityStore {
    conn: Connection,
}

impl SqliteActivityStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Opens an existing store without write access and checks its schema.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| {
                format!(
                    "failed to open activity store at {} (read-only)",
                    path.display()
                )
            })?;

        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;

        ensure_activity_schema(&conn)
            .with_context(|| format!("activity store at {} is not usable", path.display()))?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_ACTIVITY_V1)
            .context("failed to apply activity schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ACTIVITY_MIGRATION_VERSION, now],
            )
            .context("failed to register activity schema migration")?;

        Ok(())
    }

    /// Stores a plan template. Re-recording an identical plan is a no-op;
    /// plans are immutable once stored.
    pub fn upsert_plan(&self, plan: &Plan) -> Result<()> {
        insert_plan(&self.conn, plan)
    }

    pub fn get_plan(&self, plan_id: PlanId) -> Result<Option<Plan>> {
        self.conn
            .query_row(
                "SELECT plan_id, name, command, description, parameters_json, success_codes_json
                 FROM plans
                 WHERE plan_id = ?1",
                params![plan_id.to_string()],
                parse_plan_row,
            )
            .optional()
            .context("failed to load plan")
    }

    pub fn record_activity(&mut self, input: &ActivityInput) -> Result<Activity> {
        input
            .validate()
            .map_err(|err| anyhow!("activity validation failed: {err}"))?;

        let activity_id = input.activity_id.unwrap_or_default();
        let recorded_at = now_utc();
        let usages: Vec<PathBuf> = input
            .usages
            .iter()
            .map(|path| clean_relative_path(path))
            .collect();
        let generations: Vec<PathBuf> = input
            .generations
            .iter()
            .map(|path| clean_relative_path(path))
            .collect();

        let tx = self
            .conn
            .transaction()
            .context("failed to start activity transaction")?;

        insert_plan(&tx, &input.plan)?;

        tx.execute(
            "INSERT INTO activities(activity_id, plan_id, started_at, ended_at, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                activity_id.to_string(),
                input.plan.id.to_string(),
                format_rfc3339(input.started_at).map_err(|err| anyhow!(err.to_string()))?,
                format_rfc3339(input.ended_at).map_err(|err| anyhow!(err.to_string()))?,
                format_rfc3339(recorded_at).map_err(|err| anyhow!(err.to_string()))?,
            ],
        )
        .with_context(|| format!("failed to record activity {activity_id}"))?;
        let activity_seq = tx.last_insert_rowid();

        for (ordinal, path) in usages.iter().enumerate() {
            tx.execute(
                "INSERT INTO activity_usages(activity_id, ordinal, path) VALUES (?1, ?2, ?3)",
                params![
                    activity_id.to_string(),
                    i64::try_from(ordinal).context("usage ordinal overflow")?,
                    path_to_sql(path)?
                ],
            )
            .context("failed to record activity usage")?;
        }

        for (ordinal, path) in generations.iter().enumerate() {
            tx.execute(
                "INSERT INTO activity_generations(activity_id, ordinal, path) VALUES (?1, ?2, ?3)",
                params![
                    activity_id.to_string(),
                    i64::try_from(ordinal).context("generation ordinal overflow")?,
                    path_to_sql(path)?
                ],
            )
            .context("failed to record activity generation")?;
        }

        for value in &input.parameter_values {
            tx.execute(
                "INSERT INTO activity_parameter_values(activity_id, parameter_name, value)
                 VALUES (?1, ?2, ?3)",
                params![activity_id.to_string(), value.parameter_name, value.value],
            )
            .with_context(|| {
                format!(
                    "failed to record value for parameter {}",
                    value.parameter_name
                )
            })?;
        }

        tx.commit().context("failed to commit activity transaction")?;

        tracing::debug!(
            activity = %activity_id,
            activity_seq,
            plan = %input.plan.name,
            "recorded activity"
        );

        Ok(Activity {
            id: activity_id,
            activity_seq,
            plan: input.plan.clone(),
            started_at: input.started_at,
            ended_at: input.ended_at,
            usages,
            generations,
            parameter_values: input.parameter_values.clone(),
        })
    }

    /// Every recorded activity in recording order.
    pub fn list_activities(&self) -> Result<Vec<Activity>> {
        self.load_activities(None)
    }

    pub fn get_activity(&self, activity_id: ActivityId) -> Result<Option<Activity>> {
        Ok(self.load_activities(Some(activity_id))?.into_iter().next())
    }

    pub fn count_activities(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM activities", [], |row| row.get(0))
            .context("failed to count activities")?;
        usize::try_from(count).with_context(|| format!("invalid activity count: {count}"))
    }

    fn load_activities(&self, only: Option<ActivityId>) -> Result<Vec<Activity>> {
        let only = only.map(|id| id.to_string());
        let plans = self.load_plans()?;
        let usages = self.load_paths("activity_usages", only.as_deref())?;
        let generations = self.load_paths("activity_generations", only.as_deref())?;
        let mut values = self.load_parameter_values(only.as_deref())?;

        let mut stmt = self.conn.prepare(
            "SELECT activity_seq, activity_id, plan_id, started_at, ended_at
             FROM activities
             WHERE ?1 IS NULL OR activity_id = ?1
             ORDER BY activity_seq ASC",
        )?;
        let rows = stmt.query_map(params![only], parse_activity_row)?;

        let mut activities = Vec::new();
        for row in rows {
            let (activity_seq, id, plan_id, started_at, ended_at) = row?;
            let plan = plans
                .get(&plan_id)
                .cloned()
                .ok_or_else(|| anyhow!("activity {id} references unknown plan {plan_id}"))?;
            activities.push(Activity {
                id,
                activity_seq,
                plan,
                started_at,
                ended_at,
                usages: usages.get(&id).cloned().unwrap_or_default(),
                generations: generations.get(&id).cloned().unwrap_or_default(),
                parameter_values: values.remove(&id).unwrap_or_default(),
            });
        }

        Ok(activities)
    }

    fn load_plans(&self) -> Result<BTreeMap<PlanId, Plan>> {
        let mut stmt = self.conn.prepare(
            "SELECT plan_id, name, command, description, parameters_json, success_codes_json
             FROM plans",
        )?;
        let rows = stmt.query_map([], parse_plan_row)?;
        Ok(collect_rows(rows)?
            .into_iter()
            .map(|plan| (plan.id, plan))
            .collect())
    }

    fn load_paths(
        &self,
        table: &str,
        only: Option<&str>,
    ) -> Result<BTreeMap<ActivityId, Vec<PathBuf>>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT activity_id, path
             FROM {table}
             WHERE ?1 IS NULL OR activity_id = ?1
             ORDER BY activity_id ASC, ordinal ASC"
        ))?;
        let rows = stmt.query_map(params![only], |row| {
            let activity_id = parse_activity_id(&row.get::<_, String>(0)?)?;
            let path: String = row.get(1)?;
            Ok((activity_id, PathBuf::from(path)))
        })?;

        let mut grouped: BTreeMap<ActivityId, Vec<PathBuf>> = BTreeMap::new();
        for (activity_id, path) in collect_rows(rows)? {
            grouped.entry(activity_id).or_default().push(path);
        }
        Ok(grouped)
    }

    fn load_parameter_values(
        &self,
        only: Option<&str>,
    ) -> Result<BTreeMap<ActivityId, Vec<ParameterValue>>> {
        let mut stmt = self.conn.prepare(
            "SELECT activity_id, parameter_name, value
             FROM activity_parameter_values
             WHERE ?1 IS NULL OR activity_id = ?1
             ORDER BY activity_id ASC, parameter_name ASC",
        )?;
        let rows = stmt.query_map(params![only], |row| {
            let activity_id = parse_activity_id(&row.get::<_, String>(0)?)?;
            Ok((
                activity_id,
                ParameterValue {
                    parameter_name: row.get(1)?,
                    value: row.get(2)?,
                },
            ))
        })?;

        let mut grouped: BTreeMap<ActivityId, Vec<ParameterValue>> = BTreeMap::new();
        for (activity_id, value) in collect_rows(rows)? {
            grouped.entry(activity_id).or_default().push(value);
        }
        Ok(grouped)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl ActivityGateway for SqliteActivityStore {
    fn get_all_activities(&self) -> Result<Vec<Activity>> {
        self.list_activities()
    }
}

fn insert_plan(conn: &Connection, plan: &Plan) -> Result<()> {
    plan.validate()
        .map_err(|err| anyhow!("invalid plan {}: {err}", plan.name))?;

    if let Some(existing) = conn
        .query_row(
            "SELECT plan_id, name, command, description, parameters_json, success_codes_json
             FROM plans
             WHERE plan_id = ?1",
            params![plan.id.to_string()],
            parse_plan_row,
        )
        .optional()
        .context("failed to look up plan")?
    {
        if existing != *plan {
            return Err(anyhow!(
                "plan {} is already recorded with different content",
                plan.id
            ));
        }
        return Ok(());
    }

    let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
    conn.execute(
        "INSERT INTO plans(plan_id, name, command, description, parameters_json, success_codes_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            plan.id.to_string(),
            plan.name,
            plan.command,
            plan.description,
            serde_json::to_string(&plan.parameters).context("failed to serialize plan parameters")?,
            serde_json::to_string(&plan.success_codes).context("failed to serialize success codes")?,
            now,
        ],
    )
    .with_context(|| format!("failed to insert plan {}", plan.name))?;

    Ok(())
}

type ActivityRow = (
    i64,
    ActivityId,
    PlanId,
    time::OffsetDateTime,
    time::OffsetDateTime,
);

fn parse_activity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityRow> {
    let activity_id = parse_activity_id(&row.get::<_, String>(1)?)?;
    let plan_id = parse_plan_id(2, &row.get::<_, String>(2)?)?;
    let started_at = parse_rfc3339_utc(&row.get::<_, String>(3)?).map_err(to_sql_error)?;
    let ended_at = parse_rfc3339_utc(&row.get::<_, String>(4)?).map_err(to_sql_error)?;
    Ok((row.get(0)?, activity_id, plan_id, started_at, ended_at))
}

fn parse_plan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Plan> {
    let plan_id = parse_plan_id(0, &row.get::<_, String>(0)?)?;
    let parameters_json: String = row.get(4)?;
    let success_codes_json: String = row.get(5)?;

    let parameters: Vec<CommandParameter> = serde_json::from_str(&parameters_json)
        .map_err(|err| invalid_column(4, format!("invalid parameters_json: {err}")))?;
    let success_codes: Vec<i32> = serde_json::from_str(&success_codes_json)
        .map_err(|err| invalid_column(5, format!("invalid success_codes_json: {err}")))?;

    Ok(Plan {
        id: plan_id,
        name: row.get(1)?,
        command: row.get(2)?,
        description: row.get(3)?,
        parameters,
        success_codes,
    })
}

fn parse_activity_id(raw: &str) -> rusqlite::Result<ActivityId> {
    Ulid::from_string(raw)
        .map(ActivityId)
        .map_err(|_| invalid_column(0, format!("invalid activity_id ULID: {raw}")))
}

fn parse_plan_id(index: usize, raw: &str) -> rusqlite::Result<PlanId> {
    Ulid::from_string(raw)
        .map(PlanId)
        .map_err(|_| invalid_column(index, format!("invalid plan_id ULID: {raw}")))
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn to_sql_error(err: ExportError) -> rusqlite::Error {
    invalid_column(0, err.to_string())
}

fn path_to_sql(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn ensure_activity_schema(conn: &Connection) -> Result<()> {
    for (table, columns) in REQUIRED_TABLES {
        if !table_exists(conn, table)? {
            return Err(anyhow!(
                "activity schema check failed: expected table {table} (run migrations first)"
            ));
        }
        ensure_table_has_columns(conn, table, columns)?;
    }
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "activity schema check failed: table {table_name} is missing column {required}"
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use provenance_export_core::{ParameterKind, StreamMapping};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteActivityStore {
        let store = must(SqliteActivityStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_plan(name: &str) -> Plan {
        Plan {
            id: PlanId::new(),
            name: name.to_string(),
            command: "python train.py".to_string(),
            description: Some("fit a model".to_string()),
            parameters: vec![
                CommandParameter {
                    name: "epochs".to_string(),
                    kind: ParameterKind::Parameter,
                    prefix: Some("--epochs".to_string()),
                    position: Some(1),
                    default_value: "10".to_string(),
                    mapped_to: None,
                },
                CommandParameter {
                    name: "data".to_string(),
                    kind: ParameterKind::Input,
                    prefix: None,
                    position: Some(2),
                    default_value: "data.csv".to_string(),
                    mapped_to: None,
                },
                CommandParameter {
                    name: "log".to_string(),
                    kind: ParameterKind::Output,
                    prefix: None,
                    position: None,
                    default_value: "train.log".to_string(),
                    mapped_to: Some(StreamMapping::Stdout),
                },
            ],
            success_codes: vec![0, 3],
        }
    }

    fn fixture_input(plan: &Plan, minute: i64) -> ActivityInput {
        let started_at = match parse_rfc3339_utc("2026-02-07T12:00:00Z") {
            Ok(value) => value + time::Duration::minutes(minute),
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        };
        ActivityInput {
            activity_id: None,
            plan: plan.clone(),
            started_at,
            ended_at: started_at + time::Duration::seconds(30),
            usages: vec![PathBuf::from("data.csv")],
            generations: vec![PathBuf::from("train.log"), PathBuf::from("model/weights.bin")],
            parameter_values: vec![ParameterValue {
                parameter_name: "epochs".to_string(),
                value: "25".to_string(),
            }],
        }
    }

    #[test]
    fn recorded_activity_reads_back_identically() {
        let mut store = fixture_store();
        let plan = fixture_plan("train");
        let recorded = must(store.record_activity(&fixture_input(&plan, 0)));

        let loaded = must(store.list_activities());
        assert_eq!(loaded, vec![recorded.clone()]);

        let fetched = must(store.get_activity(recorded.id));
        assert_eq!(fetched, Some(recorded));
        assert_eq!(must(store.get_activity(ActivityId::new())), None);
    }

    #[test]
    fn activities_are_listed_in_recording_order() {
        let mut store = fixture_store();
        let plan = fixture_plan("train");
        let first = must(store.record_activity(&fixture_input(&plan, 5)));
        let second = must(store.record_activity(&fixture_input(&plan, 1)));

        let loaded = must(store.list_activities());
        assert_eq!(
            loaded.iter().map(|activity| activity.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );
        assert!(first.activity_seq < second.activity_seq);
        assert_eq!(must(store.count_activities()), 2);
    }

    #[test]
    fn append_only_trigger_blocks_updates_and_deletes() {
        let mut store = fixture_store();
        let activity = must(store.record_activity(&fixture_input(&fixture_plan("train"), 0)));

        let update = store.connection().execute(
            "UPDATE activities SET ended_at = started_at WHERE activity_id = ?1",
            params![activity.id.to_string()],
        );
        assert!(update.is_err());

        let delete = store.connection().execute(
            "DELETE FROM activities WHERE activity_id = ?1",
            params![activity.id.to_string()],
        );
        assert!(delete.is_err());
    }

    #[test]
    fn invalid_activity_is_rejected_without_partial_writes() {
        let mut store = fixture_store();
        let mut input = fixture_input(&fixture_plan("train"), 0);
        input.parameter_values.push(ParameterValue {
            parameter_name: "unknown".to_string(),
            value: "1".to_string(),
        });

        let result = store.record_activity(&input);
        let err = match result {
            Ok(_) => panic!("expected validation failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("activity validation failed"));
        assert_eq!(must(store.count_activities()), 0);
    }

    #[test]
    fn plans_are_immutable_once_recorded() {
        let store = fixture_store();
        let plan = fixture_plan("train");
        must(store.upsert_plan(&plan));
        must(store.upsert_plan(&plan));
        assert_eq!(must(store.get_plan(plan.id)), Some(plan.clone()));

        let mut changed = plan;
        changed.command = "python train_v2.py".to_string();
        assert!(store.upsert_plan(&changed).is_err());
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let mut store = fixture_store();
        let _ = must(store.record_activity(&fixture_input(&fixture_plan("train"), 0)));

        must(store.migrate());
        must(store.migrate());

        assert_eq!(must(store.count_activities()), 1);
        let version: i64 = match store.connection().query_row(
            "SELECT MAX(version) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to read schema_migrations: {err}"),
        };
        assert_eq!(version, ACTIVITY_MIGRATION_VERSION);
    }

    #[test]
    fn read_only_open_serves_history_and_rejects_writes() {
        let db_path =
            std::env::temp_dir().join(format!("activity-store-ro-{}.sqlite3", Ulid::new()));
        {
            let mut store = must(SqliteActivityStore::open(&db_path));
            must(store.migrate());
            let _ = must(store.record_activity(&fixture_input(&fixture_plan("train"), 0)));
        }

        let mut reader = must(SqliteActivityStore::open_read_only(&db_path));
        assert_eq!(must(reader.get_all_activities()).len(), 1);
        assert!(reader
            .record_activity(&fixture_input(&fixture_plan("train"), 1))
            .is_err());

        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(db_path.with_extension("sqlite3-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("sqlite3-shm"));
    }

    #[test]
    fn read_only_open_fails_on_missing_or_unmigrated_store() {
        let missing =
            std::env::temp_dir().join(format!("activity-store-missing-{}.sqlite3", Ulid::new()));
        assert!(SqliteActivityStore::open_read_only(&missing).is_err());

        let empty =
            std::env::temp_dir().join(format!("activity-store-empty-{}.sqlite3", Ulid::new()));
        {
            let conn = match Connection::open(&empty) {
                Ok(value) => value,
                Err(err) => panic!("failed to create empty db: {err}"),
            };
            if let Err(err) = conn.execute_batch("CREATE TABLE unrelated (id INTEGER);") {
                panic!("failed to seed empty db: {err}");
            }
        }
        let err = match SqliteActivityStore::open_read_only(&empty) {
            Ok(_) => panic!("expected schema check failure"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("expected table plans"));

        let _ = std::fs::remove_file(&empty);
    }

    #[test]
    fn corrupted_plan_json_is_reported_clearly() {
        let mut store = fixture_store();
        let activity = must(store.record_activity(&fixture_input(&fixture_plan("train"), 0)));
        if let Err(err) = store.connection().execute(
            "UPDATE plans SET parameters_json = '{' WHERE plan_id = ?1",
            params![activity.plan.id.to_string()],
        ) {
            panic!("failed to corrupt plan row: {err}");
        }

        let err = match store.list_activities() {
            Ok(_) => panic!("expected decode failure"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("invalid parameters_json"));
    }

    #[test]
    fn recorded_paths_drop_current_dir_segments() {
        let mut store = fixture_store();
        let plan = fixture_plan("train");
        let mut input = fixture_input(&plan, 0);
        input.usages = vec![PathBuf::from("./data.csv")];
        input.generations = vec![PathBuf::from("./model/./weights.bin")];

        let recorded = must(store.record_activity(&input));
        assert_eq!(recorded.usages, vec![PathBuf::from("data.csv")]);
        assert_eq!(recorded.generations, vec![PathBuf::from("model/weights.bin")]);
        assert_eq!(must(store.list_activities()), vec![recorded]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_history_round_trips_in_order(minutes in prop::collection::vec(0i64..600, 1..20)) {
            let mut store = fixture_store();
            let plan = fixture_plan("train");
            let mut recorded = Vec::new();
            for minute in minutes {
                recorded.push(must(store.record_activity(&fixture_input(&plan, minute))));
            }

            let loaded = must(store.list_activities());
            prop_assert_eq!(loaded, recorded);
        }
    }
}
