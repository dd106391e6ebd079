//! Repository functions for the `task_dependencies` table.
//!
//! Dependency writes carry the DAG invariants: no self-edges, no cycles,
//! fan-in and chain-depth limits. The cycle check runs INSIDE the insert
//! transaction against live rows, so two concurrent adds that individually
//! pass an in-memory precheck cannot jointly commit a cycle: the second
//! writer sees the first writer's edge and rolls back.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{DependencyResolution, TaskDependency};

/// Maximum number of dependencies a single task may have.
pub const MAX_FAN_IN: usize = 100;

/// Maximum length of a dependency chain.
pub const MAX_CHAIN_DEPTH: usize = 100;

/// Errors surfaced by dependency writes.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("task cannot depend on itself: {0}")]
    SelfEdge(Uuid),

    #[error("dependency already exists: {task_id} -> {depends_on}")]
    AlreadyExists { task_id: Uuid, depends_on: Uuid },

    #[error("dependency {task_id} -> {depends_on} would create a cycle")]
    Cycle { task_id: Uuid, depends_on: Uuid },

    #[error("task {task_id} already has {count} dependencies (max {MAX_FAN_IN})")]
    FanOutExceeded { task_id: Uuid, count: usize },

    #[error("dependency chain depth {depth} exceeds max {MAX_CHAIN_DEPTH}")]
    DepthExceeded { depth: usize },

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Add one dependency edge, enforcing all DAG invariants transactionally.
pub async fn add_dependency(
    pool: &SqlitePool,
    task_id: Uuid,
    depends_on: Uuid,
) -> Result<TaskDependency, DependencyError> {
    let rows = add_dependencies(pool, task_id, &[depends_on]).await?;
    Ok(rows.into_iter().next().expect("one edge inserted"))
}

/// Add a batch of dependency edges for one task, all-or-nothing.
///
/// Every edge is inserted inside a single transaction, then the invariants
/// are re-checked against the live (post-insert) state. Any violation rolls
/// the whole batch back; partial success is never observable.
pub async fn add_dependencies(
    pool: &SqlitePool,
    task_id: Uuid,
    depends_on: &[Uuid],
) -> Result<Vec<TaskDependency>, DependencyError> {
    for dep in depends_on {
        if *dep == task_id {
            return Err(DependencyError::SelfEdge(task_id));
        }
    }

    let mut tx = pool.begin().await?;
    let now = Utc::now();

    let mut inserted = Vec::with_capacity(depends_on.len());
    for dep in depends_on {
        let row = sqlx::query_as::<_, TaskDependency>(
            "INSERT INTO task_dependencies \
                 (task_id, depends_on_task_id, resolution, created_at) \
             VALUES ($1, $2, 'pending', $3) \
             RETURNING *",
        )
        .bind(task_id)
        .bind(dep)
        .bind(now)
        .fetch_one(&mut *tx)
        .await;

        match row {
            Ok(row) => inserted.push(row),
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                return Err(DependencyError::AlreadyExists {
                    task_id,
                    depends_on: *dep,
                });
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        }
    }

    // Re-check invariants against live state, new edges included.
    if let Err(e) = check_invariants(&mut tx, task_id, depends_on).await {
        tx.rollback().await?;
        return Err(e);
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Validate fan-in, acyclicity, and chain depth inside the transaction.
async fn check_invariants(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: Uuid,
    added: &[Uuid],
) -> Result<(), DependencyError> {
    let (fan_in,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM task_dependencies \
         WHERE task_id = $1 AND resolution = 'pending'",
    )
    .bind(task_id)
    .fetch_one(&mut **tx)
    .await?;

    if fan_in as usize > MAX_FAN_IN {
        return Err(DependencyError::FanOutExceeded {
            task_id,
            count: fan_in as usize,
        });
    }

    let edges: Vec<(Uuid, Uuid)> = sqlx::query_as(
        "SELECT task_id, depends_on_task_id FROM task_dependencies \
         WHERE resolution = 'pending'",
    )
    .fetch_all(&mut **tx)
    .await?;

    let mut forward: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (from, to) in &edges {
        forward.entry(*from).or_default().push(*to);
    }

    if has_cycle(&forward) {
        return Err(DependencyError::Cycle {
            task_id,
            depends_on: added.first().copied().unwrap_or(task_id),
        });
    }

    // Longest chain through the freshly-added edges. The chain containing
    // task_id is the only one that can have grown.
    let depth = depth_through(&forward, task_id);
    if depth > MAX_CHAIN_DEPTH {
        return Err(DependencyError::DepthExceeded { depth });
    }

    Ok(())
}

/// Full-graph cycle detection with a recursion-stack set.
fn has_cycle(forward: &HashMap<Uuid, Vec<Uuid>>) -> bool {
    let mut visited = HashSet::new();
    let mut stack = HashSet::new();
    for node in forward.keys() {
        if dfs_cycle(forward, *node, &mut visited, &mut stack) {
            return true;
        }
    }
    false
}

fn dfs_cycle(
    forward: &HashMap<Uuid, Vec<Uuid>>,
    node: Uuid,
    visited: &mut HashSet<Uuid>,
    stack: &mut HashSet<Uuid>,
) -> bool {
    if stack.contains(&node) {
        return true;
    }
    if !visited.insert(node) {
        return false;
    }
    stack.insert(node);
    if let Some(nexts) = forward.get(&node) {
        for next in nexts {
            if dfs_cycle(forward, *next, visited, stack) {
                return true;
            }
        }
    }
    stack.remove(&node);
    false
}

/// Longest path (in edges, plus one for the node itself) through `node`:
/// the longest chain of dependencies below it plus the longest chain of
/// dependents above it.
fn depth_through(forward: &HashMap<Uuid, Vec<Uuid>>, node: Uuid) -> usize {
    let mut reverse: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (from, tos) in forward {
        for to in tos {
            reverse.entry(*to).or_default().push(*from);
        }
    }
    let mut memo = HashMap::new();
    let below = longest_from(forward, node, &mut memo);
    let mut memo_up = HashMap::new();
    let above = longest_from(&reverse, node, &mut memo_up);
    below + above + 1
}

fn longest_from(
    adj: &HashMap<Uuid, Vec<Uuid>>,
    node: Uuid,
    memo: &mut HashMap<Uuid, usize>,
) -> usize {
    if let Some(d) = memo.get(&node) {
        return *d;
    }
    let depth = adj
        .get(&node)
        .map(|nexts| {
            nexts
                .iter()
                .map(|n| longest_from(adj, *n, memo) + 1)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    memo.insert(node, depth);
    depth
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ---------------------------------------------------------------------------
// Reads and resolution
// ---------------------------------------------------------------------------

/// Resolve every pending edge that names `dependency_id` as the dependency.
///
/// A single UPDATE so resolution is atomic across dependents. Returns the
/// number of edges resolved.
pub async fn resolve_batch(
    pool: &SqlitePool,
    dependency_id: Uuid,
    resolution: DependencyResolution,
) -> Result<u64, DependencyError> {
    let result = sqlx::query(
        "UPDATE task_dependencies \
         SET resolution = $1, resolved_at = $2 \
         WHERE depends_on_task_id = $3 AND resolution = 'pending'",
    )
    .bind(resolution)
    .bind(Utc::now())
    .bind(dependency_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Tasks that depended on `dependency_id` and now have no pending edges
/// left at all.
pub async fn newly_unblocked(
    pool: &SqlitePool,
    dependency_id: Uuid,
) -> Result<Vec<Uuid>, DependencyError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT DISTINCT task_id FROM task_dependencies \
         WHERE depends_on_task_id = $1 \
           AND task_id NOT IN ( \
               SELECT task_id FROM task_dependencies WHERE resolution = 'pending' \
           )",
    )
    .bind(dependency_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Whether the task has any unresolved incoming edge.
pub async fn is_blocked(pool: &SqlitePool, task_id: Uuid) -> Result<bool, DependencyError> {
    let (blocked,): (bool,) = sqlx::query_as(
        "SELECT EXISTS( \
             SELECT 1 FROM task_dependencies \
             WHERE task_id = $1 AND resolution = 'pending')",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await?;

    Ok(blocked)
}

/// All edges for one task (any resolution), oldest first.
pub async fn list_for_task(
    pool: &SqlitePool,
    task_id: Uuid,
) -> Result<Vec<TaskDependency>, DependencyError> {
    let rows = sqlx::query_as::<_, TaskDependency>(
        "SELECT * FROM task_dependencies WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Every pending edge in the database. Used to rebuild the in-memory graph
/// on boot.
pub async fn load_pending_edges(pool: &SqlitePool) -> Result<Vec<TaskDependency>, DependencyError> {
    let rows = sqlx::query_as::<_, TaskDependency>(
        "SELECT * FROM task_dependencies WHERE resolution = 'pending' ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Total edge count (any resolution). Test support.
pub async fn count_edges(pool: &SqlitePool) -> Result<i64, DependencyError> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task_dependencies")
        .fetch_one(pool)
        .await?;

    Ok(count)
}
