// src/store/sqlite.rs — SQLite-backed pipeline store

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{schema, PipelineStore};
use crate::infra::errors::PipelineError;
use crate::pipeline::types::{
    ExecutionResult, Experiment, GeneratedCase, Iteration, JudgeFailure, JudgeScore,
    PromptVersion,
};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, PipelineError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, PipelineError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `INSERT OR IGNORE`; reports whether a row was written.
    fn insert_ignore(&self, sql: &str, args: &[&dyn ToSql]) -> Result<bool, PipelineError> {
        Ok(self.conn().execute(sql, args)? > 0)
    }

    fn get_doc<T: DeserializeOwned>(&self, table: &str, id: &str) -> Result<Option<T>, PipelineError> {
        let body: Option<String> = self
            .conn()
            .query_row(
                &format!("SELECT body FROM {table} WHERE id = ?1"),
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(PipelineError::from))
            .transpose()
    }

    fn list_docs<T: DeserializeOwned>(
        &self,
        sql: &str,
        parent: &str,
    ) -> Result<Vec<T>, PipelineError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![parent], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?)?);
        }
        Ok(out)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, PipelineError> {
    Ok(serde_json::to_string(value)?)
}

impl PipelineStore for SqliteStore {
    // -- Experiments --

    fn put_experiment(&self, experiment: &Experiment) -> Result<bool, PipelineError> {
        let body = to_json(experiment)?;
        self.insert_ignore(
            "INSERT OR IGNORE INTO experiments (id, project_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            &[
                &experiment.id,
                &experiment.project_id,
                &body,
                &experiment.created_at.to_rfc3339(),
            ],
        )
    }

    fn get_experiment(&self, id: &str) -> Result<Option<Experiment>, PipelineError> {
        self.get_doc("experiments", id)
    }

    fn list_experiments(&self) -> Result<Vec<Experiment>, PipelineError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT body FROM experiments ORDER BY id")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?)?);
        }
        Ok(out)
    }

    fn set_current_version(&self, experiment_id: &str, version: u32) -> Result<(), PipelineError> {
        let mut experiment: Experiment = self
            .get_doc("experiments", experiment_id)?
            .ok_or_else(|| PipelineError::not_found("experiment", experiment_id))?;
        experiment.current_version = version;
        self.conn().execute(
            "UPDATE experiments SET body = ?1 WHERE id = ?2",
            params![to_json(&experiment)?, experiment_id],
        )?;
        Ok(())
    }

    // -- Prompt versions --

    fn put_prompt_version(&self, version: &PromptVersion) -> Result<bool, PipelineError> {
        let body = to_json(version)?;
        self.insert_ignore(
            "INSERT OR IGNORE INTO prompt_versions (id, experiment_id, version, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            &[
                &version.id,
                &version.experiment_id,
                &version.version,
                &body,
                &version.created_at.to_rfc3339(),
            ],
        )
    }

    fn get_prompt_version(&self, id: &str) -> Result<Option<PromptVersion>, PipelineError> {
        self.get_doc("prompt_versions", id)
    }

    // -- Iterations --

    fn save_iteration(&self, iteration: &Iteration) -> Result<(), PipelineError> {
        self.conn().execute(
            "INSERT INTO iterations (id, experiment_id, ordinal, state, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state, body = excluded.body, updated_at = excluded.updated_at",
            params![
                iteration.id,
                iteration.experiment_id,
                iteration.ordinal,
                iteration.state.as_str(),
                to_json(iteration)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_iteration(&self, id: &str) -> Result<Option<Iteration>, PipelineError> {
        self.get_doc("iterations", id)
    }

    fn list_iterations(&self, experiment_id: &str) -> Result<Vec<Iteration>, PipelineError> {
        self.list_docs(
            "SELECT body FROM iterations WHERE experiment_id = ?1 ORDER BY ordinal",
            experiment_id,
        )
    }

    // -- Stage results --

    fn put_execution(&self, result: &ExecutionResult) -> Result<bool, PipelineError> {
        let body = to_json(result)?;
        self.insert_ignore(
            "INSERT OR IGNORE INTO executions (id, iteration_id, body) VALUES (?1, ?2, ?3)",
            &[&result.id, &result.iteration_id, &body],
        )
    }

    fn get_execution(&self, id: &str) -> Result<Option<ExecutionResult>, PipelineError> {
        self.get_doc("executions", id)
    }

    fn list_executions(&self, iteration_id: &str) -> Result<Vec<ExecutionResult>, PipelineError> {
        self.list_docs(
            "SELECT body FROM executions WHERE iteration_id = ?1 ORDER BY id",
            iteration_id,
        )
    }

    fn put_judge_score(&self, score: &JudgeScore) -> Result<bool, PipelineError> {
        let body = to_json(score)?;
        self.insert_ignore(
            "INSERT OR IGNORE INTO judge_scores (id, iteration_id, overall, body)
             VALUES (?1, ?2, ?3, ?4)",
            &[&score.id, &score.iteration_id, &score.overall, &body],
        )
    }

    fn list_judge_scores(&self, iteration_id: &str) -> Result<Vec<JudgeScore>, PipelineError> {
        self.list_docs(
            "SELECT body FROM judge_scores WHERE iteration_id = ?1 ORDER BY id",
            iteration_id,
        )
    }

    fn put_judge_failure(&self, failure: &JudgeFailure) -> Result<bool, PipelineError> {
        let body = to_json(failure)?;
        self.insert_ignore(
            "INSERT OR IGNORE INTO judge_failures (id, iteration_id, body) VALUES (?1, ?2, ?3)",
            &[&failure.id, &failure.iteration_id, &body],
        )
    }

    fn list_judge_failures(&self, iteration_id: &str) -> Result<Vec<JudgeFailure>, PipelineError> {
        self.list_docs(
            "SELECT body FROM judge_failures WHERE iteration_id = ?1 ORDER BY id",
            iteration_id,
        )
    }

    fn has_judgment(&self, id: &str) -> Result<bool, PipelineError> {
        let found: i64 = self.conn().query_row(
            "SELECT (SELECT COUNT(*) FROM judge_scores WHERE id = ?1)
                  + (SELECT COUNT(*) FROM judge_failures WHERE id = ?1)",
            params![id],
            |r| r.get(0),
        )?;
        Ok(found > 0)
    }

    fn put_generated_case(&self, case: &GeneratedCase) -> Result<bool, PipelineError> {
        let body = to_json(case)?;
        self.insert_ignore(
            "INSERT OR IGNORE INTO generated_cases (id, experiment_id, iteration_id, body)
             VALUES (?1, ?2, ?3, ?4)",
            &[&case.id, &case.experiment_id, &case.iteration_id, &body],
        )
    }

    fn list_generated_cases(&self, experiment_id: &str) -> Result<Vec<GeneratedCase>, PipelineError> {
        self.list_docs(
            "SELECT body FROM generated_cases WHERE experiment_id = ?1 ORDER BY id",
            experiment_id,
        )
    }
}
