use anyhow::{anyhow, Result};
use async_trait::async_trait;
use duckdb::{Connection, OptionalExt};

use pulse_core::analytics::{Goal, GoalType, SiteConfig};
use pulse_core::error::StoreError;
use pulse_core::store::SiteRegistry;

use crate::backend::DuckDbBackend;

fn goal_type_str(goal_type: GoalType) -> Result<String> {
    match serde_json::to_value(goal_type)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(anyhow!("goal type serialized as {other}")),
    }
}

pub fn get_site_inner(conn: &Connection, site_id: &str) -> Result<Option<SiteConfig>> {
    let site = conn
        .prepare("SELECT id, name, timezone, public FROM sites WHERE id = ?1")?
        .query_row(duckdb::params![site_id], |row| {
            Ok(SiteConfig {
                id: row.get(0)?,
                name: row.get(1)?,
                timezone: row.get(2)?,
                public: row.get(3)?,
            })
        })
        .optional()?;
    Ok(site)
}

pub fn get_goal_inner(conn: &Connection, site_id: &str, goal_id: &str) -> Result<Option<Goal>> {
    let row = conn
        .prepare(
            "SELECT id, site_id, name, goal_type, definition FROM goals \
             WHERE site_id = ?1 AND id = ?2",
        )?
        .query_row(duckdb::params![site_id, goal_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .optional()?;

    let Some((id, site_id, name, goal_type, definition)) = row else {
        return Ok(None);
    };
    Ok(Some(Goal {
        goal_type: serde_json::from_value(serde_json::Value::String(goal_type))?,
        definition: serde_json::from_str(&definition)?,
        id,
        site_id,
        name,
    }))
}

impl DuckDbBackend {
    /// Insert or update a site row. Safe to call repeatedly with the same id.
    pub async fn put_site(&self, site: &SiteConfig) -> Result<()> {
        let conn = self.lock().await?;
        conn.execute(
            r#"INSERT INTO sites (id, name, timezone, public, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, now(), now())
               ON CONFLICT (id) DO UPDATE SET
                   name = EXCLUDED.name,
                   timezone = EXCLUDED.timezone,
                   public = EXCLUDED.public,
                   updated_at = now()"#,
            duckdb::params![site.id, site.name, site.timezone, site.public],
        )?;
        Ok(())
    }

    /// Insert or update a goal definition.
    pub async fn put_goal(&self, goal: &Goal) -> Result<()> {
        let goal_type = goal_type_str(goal.goal_type)?;
        let definition = serde_json::to_string(&goal.definition)?;
        let conn = self.lock().await?;
        conn.execute(
            r#"INSERT INTO goals (id, site_id, name, goal_type, definition, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, now(), now())
               ON CONFLICT (site_id, id) DO UPDATE SET
                   name = EXCLUDED.name,
                   goal_type = EXCLUDED.goal_type,
                   definition = EXCLUDED.definition,
                   updated_at = now()"#,
            duckdb::params![goal.id, goal.site_id, goal.name, goal_type, definition],
        )?;
        Ok(())
    }
}

#[async_trait]
impl SiteRegistry for DuckDbBackend {
    async fn get_goal(&self, site_id: &str, goal_id: &str) -> Result<Option<Goal>, StoreError> {
        let conn = self.lock().await?;
        get_goal_inner(&conn, site_id, goal_id).map_err(StoreError::Query)
    }

    async fn get_site(&self, site_id: &str) -> Result<Option<SiteConfig>, StoreError> {
        let conn = self.lock().await?;
        get_site_inner(&conn, site_id).map_err(StoreError::Query)
    }
}
