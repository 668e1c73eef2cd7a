//! Store seam used by the writer and the room reconciler.
//!
//! Every method is one all-or-nothing unit: concurrent readers either see the
//! full effect of a call or none of it.

use crate::db::models::{Measurement, NewMeasurement, NewRoomAssoc};
use crate::error::IngestError;
use crate::schema;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::upsert::excluded;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{info, warn};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

// 8 bind parameters per row, PostgreSQL caps a statement at 65535
const UPSERT_CHUNK_ROWS: usize = 1000;

pub trait Store {
    /// Insert-or-replace on `(sensor_id, time)`. Rows must already be unique by key.
    fn upsert_measurements(&mut self, rows: &[NewMeasurement]) -> Result<usize, IngestError>;

    /// Replace the whole association set with `rows`.
    fn replace_room_assocs(&mut self, rows: &[NewRoomAssoc]) -> Result<usize, IngestError>;

    /// Most recent stored cumulative rain value per sensor, for sensors that have one.
    fn latest_rain_totals(&mut self, sensor_ids: &[String]) -> Result<HashMap<String, f64>, IngestError>;
}

/// PostgreSQL/TimescaleDB store. The connection is re-established lazily after
/// it was found broken, so one outage costs a cycle, not the process.
pub struct PgStore {
    database_url: String,
    conn: Option<PgConnection>,
}

impl PgStore {
    /// Connect, retrying `retries` times `wait` apart, then apply pending migrations.
    pub fn connect(database_url: &str, retries: u32, wait: Duration) -> Result<Self, String> {
        let attempts = retries.max(1);
        let mut last_err = String::new();
        for attempt in 1..=attempts {
            info!("Connecting to database (attempt {}/{})", attempt, attempts);
            match PgConnection::establish(database_url) {
                Ok(mut conn) => {
                    info!("Connected to database");
                    apply_database_migrations(&mut conn)?;
                    return Ok(PgStore {
                        database_url: database_url.to_string(),
                        conn: Some(conn),
                    });
                }
                Err(e) => {
                    warn!("Database connection failed: {}", e);
                    last_err = e.to_string();
                    if attempt < attempts {
                        info!("Retrying in {}s", wait.as_secs());
                        thread::sleep(wait);
                    }
                }
            }
        }
        Err(format!(
            "DB connection failed after {} attempt(s): {}",
            attempts, last_err
        ))
    }

    fn with_conn<T>(
        &mut self,
        op: impl FnOnce(&mut PgConnection) -> Result<T, DieselError>,
    ) -> Result<T, IngestError> {
        if self.conn.is_none() {
            info!("Re-establishing database connection");
            self.conn = Some(PgConnection::establish(&self.database_url)?);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(IngestError::StorageFailure("no database connection".to_string()));
        };

        match op(conn) {
            Ok(v) => Ok(v),
            Err(e) => {
                if connection_is_broken(&e) {
                    warn!("Dropping broken database connection: {}", e);
                    self.conn = None;
                }
                Err(e.into())
            }
        }
    }
}

fn connection_is_broken(e: &DieselError) -> bool {
    matches!(
        e,
        DieselError::BrokenTransactionManager
            | DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _)
            | DieselError::DatabaseError(DatabaseErrorKind::UnableToSendCommand, _)
    )
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

impl Store for PgStore {
    fn upsert_measurements(&mut self, rows: &[NewMeasurement]) -> Result<usize, IngestError> {
        if rows.is_empty() {
            return Ok(0);
        }

        use schema::measurements::dsl as M;

        self.with_conn(|conn| {
            conn.transaction(|conn| {
                let mut written = 0usize;
                for chunk in rows.chunks(UPSERT_CHUNK_ROWS) {
                    written += diesel::insert_into(M::measurements)
                        .values(chunk)
                        .on_conflict((M::sensor_id, M::time))
                        .do_update()
                        .set((
                            M::t1.eq(excluded(M::t1)),
                            M::t2.eq(excluded(M::t2)),
                            M::h.eq(excluded(M::h)),
                            M::r.eq(excluded(M::r)),
                            M::rf.eq(excluded(M::rf)),
                            M::rr.eq(excluded(M::rr)),
                        ))
                        .execute(conn)?;
                }
                Ok(written)
            })
        })
    }

    fn replace_room_assocs(&mut self, rows: &[NewRoomAssoc]) -> Result<usize, IngestError> {
        use schema::room_assoc::dsl as R;

        self.with_conn(|conn| {
            conn.transaction(|conn| {
                let removed = diesel::delete(R::room_assoc).execute(conn)?;
                log::debug!("Removed {} previous room association(s)", removed);
                if rows.is_empty() {
                    return Ok(0);
                }
                diesel::insert_into(R::room_assoc).values(rows).execute(conn)
            })
        })
    }

    fn latest_rain_totals(&mut self, sensor_ids: &[String]) -> Result<HashMap<String, f64>, IngestError> {
        if sensor_ids.is_empty() {
            return Ok(HashMap::new());
        }

        use schema::measurements::dsl as M;

        let rows: Vec<Measurement> = self.with_conn(|conn| {
            M::measurements
                .filter(M::sensor_id.eq_any(sensor_ids))
                .filter(M::r.is_not_null())
                .order((M::sensor_id.asc(), M::time.desc()))
                .distinct_on(M::sensor_id)
                .select(Measurement::as_select())
                .load(conn)
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|m| m.r.map(|r| (m.sensor_id, r)))
            .collect())
    }
}
