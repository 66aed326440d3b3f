use capsule_core::capsule::{Capsule, CreateCapsuleRequest, Quota, VmMode, VmPorts, VmState};
use capsule_core::error::{CapsuleError, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::info;

const CAPSULE_COLUMNS: &str = "v.vm_id, u.username, v.state, v.vm_mode, v.public_ip, \
     v.ssh_port, v.vnc_port, v.vnc_username, v.vnc_password, v.working_dir, v.image_name, \
     v.num_cpus, v.memory_size_mb, v.disk_space_gb, v.full_access, v.created_at, v.updated_at";

/// Durable record of capsules, ownership links, and per-user quota.
///
/// This is the single source of truth for capsule state. All mutation goes
/// through the operations here (and the state machine's transition call);
/// quota reservation and restoration are single conditional statements, so a
/// concurrent check-then-update can never lose an update.
#[derive(Clone)]
pub struct CapsuleStore {
    pool: SqlitePool,
}

impl CapsuleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the user row with the configured starting quota if it does not
    /// exist yet. Re-running for an existing user changes nothing.
    pub async fn insert_user_if_absent(
        &self,
        username: &str,
        email: &str,
        starting_quota: &Quota,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO users \
             (username, user_email, disk_left_quota_gb, cpu_left_quota, memory_left_quota_mb, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(username)
        .bind(email)
        .bind(starting_quota.disk_gb)
        .bind(starting_quota.cpu)
        .bind(starting_quota.memory_mb)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remaining quota for a user.
    pub async fn get_quota(&self, username: &str) -> Result<Quota> {
        let row = sqlx::query_as::<_, QuotaRow>(
            "SELECT disk_left_quota_gb, cpu_left_quota, memory_left_quota_mb \
             FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CapsuleError::NotFound(format!("user {}", username)))?;

        Ok(row.into())
    }

    /// Reserve quota for a capsule: all three dimensions are decremented
    /// together or not at all. The check and the decrement are one
    /// conditional UPDATE, so concurrent reservations for the same user
    /// cannot overdraw the budget.
    pub async fn reserve_quota(&self, username: &str, request: &Quota) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET \
               disk_left_quota_gb = disk_left_quota_gb - ?, \
               cpu_left_quota = cpu_left_quota - ?, \
               memory_left_quota_mb = memory_left_quota_mb - ? \
             WHERE username = ? \
               AND disk_left_quota_gb >= ? AND cpu_left_quota >= ? AND memory_left_quota_mb >= ?",
        )
        .bind(request.disk_gb)
        .bind(request.cpu)
        .bind(request.memory_mb)
        .bind(username)
        .bind(request.disk_gb)
        .bind(request.cpu)
        .bind(request.memory_mb)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing user from an exhausted budget.
            self.get_quota(username).await?;
            return Err(CapsuleError::QuotaExceeded(username.to_string()));
        }

        Ok(())
    }

    /// Hand a reservation back, e.g. when record creation failed after the
    /// quota was already taken.
    pub async fn restore_quota(&self, username: &str, amount: &Quota) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET \
               disk_left_quota_gb = disk_left_quota_gb + ?, \
               cpu_left_quota = cpu_left_quota + ?, \
               memory_left_quota_mb = memory_left_quota_mb + ? \
             WHERE username = ?",
        )
        .bind(amount.disk_gb)
        .bind(amount.cpu)
        .bind(amount.memory_mb)
        .bind(username)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CapsuleError::NotFound(format!("user {}", username)));
        }

        Ok(())
    }

    /// Insert the capsule record and its ownership link in one transaction;
    /// a capsule is never visible without its owner.
    pub async fn insert_capsule(&self, req: &CreateCapsuleRequest) -> Result<Capsule> {
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO vms \
             (vm_id, state, vm_mode, public_ip, ssh_port, vnc_port, vnc_username, vnc_password, \
              working_dir, image_name, num_cpus, memory_size_mb, disk_space_gb, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&req.vm_id)
        .bind(VmState::CreatePending)
        .bind(VmMode::NotDefined)
        .bind(&req.host.public_ip)
        .bind(req.host.ssh_port)
        .bind(req.host.vnc_port)
        .bind(&req.vnc_username)
        .bind(&req.vnc_password)
        .bind(&req.working_dir)
        .bind(&req.image_name)
        .bind(req.num_cpus)
        .bind(req.memory_size_mb)
        .bind(req.disk_space_gb)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO user_vms (username, vm_id) VALUES (?, ?)")
            .bind(&req.username)
            .bind(&req.vm_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.get_capsule(&req.username, &req.vm_id).await
    }

    /// Fetch one capsule owned by `username`.
    pub async fn get_capsule(&self, username: &str, vm_id: &str) -> Result<Capsule> {
        let sql = format!(
            "SELECT {CAPSULE_COLUMNS} FROM vms v \
             JOIN user_vms u ON u.vm_id = v.vm_id \
             WHERE u.username = ? AND v.vm_id = ? AND u.deleted = 0"
        );

        let row = sqlx::query_as::<_, CapsuleRow>(&sql)
            .bind(username)
            .bind(vm_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                CapsuleError::NotFound(format!("VM {} with user {}", vm_id, username))
            })?;

        Ok(row.into())
    }

    /// All live capsules owned by `username`.
    pub async fn list_capsules(&self, username: &str) -> Result<Vec<Capsule>> {
        let sql = format!(
            "SELECT {CAPSULE_COLUMNS} FROM vms v \
             JOIN user_vms u ON u.vm_id = v.vm_id \
             WHERE u.username = ? AND u.deleted = 0 \
             ORDER BY v.created_at DESC"
        );

        let rows = sqlx::query_as::<_, CapsuleRow>(&sql)
            .bind(username)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Every live capsule in the store, used to resume bookkeeping at
    /// process start.
    pub async fn list_all_capsules(&self) -> Result<Vec<Capsule>> {
        let sql = format!(
            "SELECT {CAPSULE_COLUMNS} FROM vms v \
             JOIN user_vms u ON u.vm_id = v.vm_id \
             WHERE u.deleted = 0 \
             ORDER BY v.created_at DESC"
        );

        let rows = sqlx::query_as::<_, CapsuleRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Remove the capsule row, mark the ownership link deleted, and restore
    /// the owner's quota, all in one transaction.
    ///
    /// The quota restore only happens when this call actually removed the
    /// row, so re-running the deletion (after a partial earlier attempt)
    /// never restores twice.
    pub async fn delete_capsule(&self, username: &str, capsule: &Capsule) -> Result<()> {
        let footprint = capsule.quota_footprint();

        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM vms WHERE vm_id = ?")
            .bind(&capsule.vm_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("UPDATE user_vms SET deleted = 1 WHERE vm_id = ?")
            .bind(&capsule.vm_id)
            .execute(&mut *tx)
            .await?;

        if removed > 0 {
            sqlx::query(
                "UPDATE users SET \
                   disk_left_quota_gb = disk_left_quota_gb + ?, \
                   cpu_left_quota = cpu_left_quota + ?, \
                   memory_left_quota_mb = memory_left_quota_mb + ? \
                 WHERE username = ?",
            )
            .bind(footprint.disk_gb)
            .bind(footprint.cpu)
            .bind(footprint.memory_mb)
            .bind(username)
            .execute(&mut *tx)
            .await?;
        } else {
            info!(
                vm_id = %capsule.vm_id,
                "capsule row already removed, skipping quota restore"
            );
        }

        tx.commit().await?;

        Ok(())
    }

    /// Rewrite the capsule's host and ports after a migration.
    pub async fn update_host_and_ports(&self, vm_id: &str, ports: &VmPorts) -> Result<()> {
        let result = sqlx::query(
            "UPDATE vms SET public_ip = ?, ssh_port = ?, vnc_port = ?, updated_at = ? \
             WHERE vm_id = ?",
        )
        .bind(&ports.public_ip)
        .bind(ports.ssh_port)
        .bind(ports.vnc_port)
        .bind(Utc::now().timestamp())
        .bind(vm_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CapsuleError::NotFound(format!("VM {}", vm_id)));
        }

        Ok(())
    }

    /// Set or clear the capsule-sharing tier flag.
    pub async fn update_full_access(&self, vm_id: &str, full_access: Option<bool>) -> Result<()> {
        let result = sqlx::query("UPDATE vms SET full_access = ?, updated_at = ? WHERE vm_id = ?")
            .bind(full_access)
            .bind(Utc::now().timestamp())
            .bind(vm_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CapsuleError::NotFound(format!("VM {}", vm_id)));
        }

        Ok(())
    }
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct CapsuleRow {
    vm_id: String,
    username: String,
    state: VmState,
    vm_mode: VmMode,
    public_ip: String,
    ssh_port: u16,
    vnc_port: u16,
    vnc_username: String,
    vnc_password: String,
    working_dir: String,
    image_name: String,
    num_cpus: i64,
    memory_size_mb: i64,
    disk_space_gb: i64,
    full_access: Option<bool>,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct QuotaRow {
    disk_left_quota_gb: i64,
    cpu_left_quota: i64,
    memory_left_quota_mb: i64,
}

impl From<CapsuleRow> for Capsule {
    fn from(row: CapsuleRow) -> Self {
        Self {
            vm_id: row.vm_id,
            owner: row.username,
            state: row.state,
            mode: row.vm_mode,
            public_ip: row.public_ip,
            ssh_port: row.ssh_port,
            vnc_port: row.vnc_port,
            vnc_username: row.vnc_username,
            vnc_password: row.vnc_password,
            working_dir: row.working_dir,
            image_name: row.image_name,
            num_cpus: row.num_cpus,
            memory_size_mb: row.memory_size_mb,
            disk_space_gb: row.disk_space_gb,
            full_access: row.full_access,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
        }
    }
}

impl From<QuotaRow> for Quota {
    fn from(row: QuotaRow) -> Self {
        Self {
            disk_gb: row.disk_left_quota_gb,
            cpu: row.cpu_left_quota,
            memory_mb: row.memory_left_quota_mb,
        }
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
