use crate::batch_ops;
use crate::db_types::BatchOperation;
use crate::state_machine::BatchOperationStatus;
use crate::types::AppState;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Task that executes queued batch operations out-of-line from the requests
/// that queued them.  The `queued` status row is the durable signal: the
/// channel only wakes the runner early, and the interval sweep picks up
/// anything a lost wake-up (or a restart) left behind, so delivery is
/// at-least-once and the job bodies stay idempotent.
pub async fn run_batch_operations(app_state: Arc<AppState>, mut queue: mpsc::Receiver<i32>) {
    let mut sweep =
        tokio::time::interval(Duration::from_secs(crate::consts::BATCH_OPERATION_SWEEP_SECS));
    loop {
        tokio::select! {
            notified = queue.recv() => {
                match notified {
                    Some(batch_operation_id) => run_one(&app_state, batch_operation_id).await,
                    None => break,
                }
            }
            _ = sweep.tick() => {
                sweep_queued(&app_state).await;
            }
        }
    }
}

async fn sweep_queued(app_state: &AppState) {
    let queued = sqlx::query_as::<_, BatchOperation>(
        "select * from batch_operations where status = $1 order by id",
    )
    .bind(BatchOperationStatus::Queued.as_str())
    .fetch_all(&app_state.db_pool)
    .await;
    match queued {
        Ok(operations) => {
            for op in operations {
                run_one(app_state, op.id).await;
            }
        }
        Err(e) => {
            error!(error = %e, "failed to sweep queued batch operations");
        }
    }
}

async fn run_one(app_state: &AppState, batch_operation_id: i32) {
    // claim the job; losing the race to another sweep just means skipping it
    let claimed = sqlx::query_as::<_, BatchOperation>(
        "update batch_operations set status = $1, updated_at = now() \
         where id = $2 and status = $3 returning *",
    )
    .bind(BatchOperationStatus::Running.as_str())
    .bind(batch_operation_id)
    .bind(BatchOperationStatus::Queued.as_str())
    .fetch_optional(&app_state.db_pool)
    .await;
    let op = match claimed {
        Ok(Some(op)) => op,
        Ok(None) => {
            debug!(batch_operation_id, "batch operation is not queued; skipping");
            return;
        }
        Err(e) => {
            error!(batch_operation_id, error = %e, "failed to claim batch operation");
            return;
        }
    };

    let run_id = Uuid::new_v4();
    info!(run_id = %run_id, batch_operation_id, op_type = %op.op_type, "executing batch operation");
    match batch_ops::execute(&op, app_state).await {
        Ok(()) => {
            let finished = sqlx::query(
                "update batch_operations set status = $1, updated_at = now() \
                 where id = $2 and status = $3",
            )
            .bind(BatchOperationStatus::Finished.as_str())
            .bind(batch_operation_id)
            .bind(BatchOperationStatus::Running.as_str())
            .execute(&app_state.db_pool)
            .await;
            match finished {
                Ok(_) => info!(run_id = %run_id, batch_operation_id, "batch operation finished"),
                Err(e) => {
                    error!(run_id = %run_id, batch_operation_id, error = %e, "failed to finish batch operation");
                }
            }
        }
        Err(e) => {
            // job-fatal: left visibly in `running` for operator intervention
            error!(run_id = %run_id, batch_operation_id, error = %e, "batch operation failed");
        }
    }
}
