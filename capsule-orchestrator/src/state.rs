use capsule_core::capsule::{VmMode, VmState};
use capsule_core::error::{CapsuleError, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

/// Applies state transitions atomically against the persisted capsule row.
///
/// The legal edges live on [`VmState::can_transit_to`]; this type enforces
/// them with a compare-and-set UPDATE so that a transition only happens when
/// the persisted state still equals the caller's `from`. Mode-based business
/// rules are the caller's concern; the mode setter here is unconditional.
#[derive(Clone)]
pub struct StateMachine {
    pool: SqlitePool,
}

impl StateMachine {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Transition `vm_id` from `from` to `to`.
    ///
    /// Fails with `InvalidTransition` when the edge is not in the table or
    /// when the persisted state no longer matches `from` (a concurrent
    /// worker may have advanced it); fails with `NotFound` when the row does
    /// not exist. The check and the write are one statement, so two workers
    /// racing on the same row cannot both win.
    pub async fn transit_to(
        &self,
        vm_id: &str,
        from: VmState,
        to: VmState,
        actor: Option<&str>,
    ) -> Result<()> {
        if !from.can_transit_to(to) {
            return Err(CapsuleError::InvalidTransition {
                vm_id: vm_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
                current: from.to_string(),
            });
        }

        let result = sqlx::query("UPDATE vms SET state = ?, updated_at = ? WHERE vm_id = ? AND state = ?")
            .bind(to)
            .bind(Utc::now().timestamp())
            .bind(vm_id)
            .bind(from)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let actual = self.fetch_state(vm_id).await?;
            return match actual {
                None => Err(CapsuleError::NotFound(format!("VM {}", vm_id))),
                Some(current) => Err(CapsuleError::InvalidTransition {
                    vm_id: vm_id.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                    current: current.to_string(),
                }),
            };
        }

        info!(
            vm_id,
            %from,
            %to,
            actor = actor.unwrap_or("system"),
            "vm state transition"
        );

        Ok(())
    }

    /// The persisted (state, mode) pair, for callers checking preconditions.
    pub async fn current(&self, vm_id: &str) -> Result<(VmState, VmMode)> {
        let row = sqlx::query_as::<_, (VmState, VmMode)>(
            "SELECT state, vm_mode FROM vms WHERE vm_id = ?",
        )
        .bind(vm_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CapsuleError::NotFound(format!("VM {}", vm_id)))?;

        Ok(row)
    }

    /// Set the capsule's mode. Independent of state; preconditions on the
    /// (state, mode) pair are checked by the command/request layer.
    pub async fn update_mode(&self, vm_id: &str, mode: VmMode) -> Result<()> {
        let result = sqlx::query("UPDATE vms SET vm_mode = ?, updated_at = ? WHERE vm_id = ?")
            .bind(mode)
            .bind(Utc::now().timestamp())
            .bind(vm_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CapsuleError::NotFound(format!("VM {}", vm_id)));
        }

        info!(vm_id, %mode, "vm mode updated");

        Ok(())
    }

    async fn fetch_state(&self, vm_id: &str) -> Result<Option<VmState>> {
        let state = sqlx::query_as::<_, (VmState,)>("SELECT state FROM vms WHERE vm_id = ?")
            .bind(vm_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|(state,)| state);

        Ok(state)
    }
}
