use sqlx::postgres::PgPoolOptions;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

pub async fn make_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

/// FNV-1a, 64-bit. Deterministic across processes and languages, which is
/// the property the advisory-lock key needs — not cryptographic strength.
pub(crate) fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Splits the 64-bit hash of `"{table}-{id}"` into the pair of signed
/// 32-bit integers `pg_try_advisory_lock(int, int)` expects, per spec
/// §4.1's "bit-packed into a pair of signed 32-bit ints" convention for
/// interop with the peer runtime.
pub fn advisory_lock_key(table: &str, id: Uuid) -> (i32, i32) {
    let hash = fnv1a64(format!("{table}-{id}").as_bytes());
    let hi = (hash >> 32) as u32 as i32;
    let lo = (hash & 0xffff_ffff) as u32 as i32;
    (hi, lo)
}

/// A session-scoped advisory lock held on a dedicated connection checked
/// out of the pool. Dropping this without calling [`AdvisoryLock::unlock`]
/// still releases the lock the moment the connection itself is dropped or
/// the backend goes away — the guarantee spec's design notes require
/// ("releasing on connection drop MUST remain implicit") — but callers
/// should call `unlock` to return the connection to the pool promptly
/// rather than paying for a fresh one next time.
pub struct AdvisoryLock {
    conn: Option<PoolConnection<Postgres>>,
    key: (i32, i32),
}

impl AdvisoryLock {
    /// Attempts `pg_try_advisory_lock(hi, lo)` on a freshly checked-out
    /// connection. Returns `None` (and returns the connection to the pool)
    /// if another session already holds it.
    pub async fn try_acquire(pool: &PgPool, table: &str, id: Uuid) -> sqlx::Result<Option<Self>> {
        let key = advisory_lock_key(table, id);
        let mut conn = pool.acquire().await?;

        let acquired: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
                .bind(key.0)
                .bind(key.1)
                .fetch_one(&mut *conn)
                .await?;

        if acquired {
            Ok(Some(Self {
                conn: Some(conn),
                key,
            }))
        } else {
            Ok(None)
        }
    }

    /// Whether any session currently holds the lock for `(table, id)`.
    /// Introspection only — mirrors spec §4.1's `advisory_locked?`.
    pub async fn is_locked(pool: &PgPool, table: &str, id: Uuid) -> sqlx::Result<bool> {
        let key = advisory_lock_key(table, id);
        let held: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_locks
                WHERE locktype = 'advisory'
                  AND classid = $1
                  AND objid = $2
                  AND objsubid = 2
            )
            "#,
        )
        .bind(key.0)
        .bind(key.1)
        .fetch_one(pool)
        .await?;
        Ok(held)
    }

    pub async fn unlock(mut self) -> sqlx::Result<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1, $2)")
                .bind(self.key.0)
                .bind(self.key.1)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Borrow the underlying connection to run statements (e.g. marking
    /// the row running) while the lock is held.
    pub fn connection(&mut self) -> &mut PoolConnection<Postgres> {
        self.conn.as_mut().expect("connection taken after unlock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_lock_key_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(
            advisory_lock_key("good_jobs", id),
            advisory_lock_key("good_jobs", id)
        );
    }

    #[test]
    fn advisory_lock_key_differs_by_table() {
        let id = Uuid::new_v4();
        assert_ne!(
            advisory_lock_key("good_jobs", id),
            advisory_lock_key("other_table", id)
        );
    }
}
