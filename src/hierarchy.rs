//! Sponsor hierarchy as a closure table, capped at [`MAX_DEPTH`] levels.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, instrument, warn};

use crate::types::HierarchyLink;

/// Deepest level that earns commissions and gets a closure row.
pub const MAX_DEPTH: u8 = 5;

/// An ancestor of some user, as the commission walk sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ancestor {
    pub user_id: i64,
    pub depth: u8,
    pub is_active: bool,
}

/// Closure rows `(ancestor_id, depth)` for a node placed under `sponsor_id`,
/// derived from the sponsor's own rows.
pub fn closure_for(sponsor_id: i64, sponsor_ancestors: &[(i64, u8)], max_depth: u8) -> Vec<(i64, u8)> {
    if max_depth == 0 {
        return Vec::new();
    }
    let mut rows = vec![(sponsor_id, 1)];
    rows.extend(
        sponsor_ancestors
            .iter()
            .filter(|(_, depth)| *depth >= 1 && *depth < max_depth)
            .map(|(ancestor, depth)| (*ancestor, depth + 1)),
    );
    rows.sort_by_key(|(_, depth)| *depth);
    rows
}

/// Closure rows for `user_id` obtained by following `sponsor_of` upward.
/// Stops at a root, at `max_depth`, or when the chain loops back on itself.
pub fn closure_from_sponsors(
    user_id: i64,
    sponsor_of: &HashMap<i64, Option<i64>>,
    max_depth: u8,
) -> Vec<(i64, u8)> {
    let mut rows = Vec::new();
    let mut seen = HashSet::from([user_id]);
    let mut current = user_id;

    for depth in 1..=max_depth {
        let Some(Some(sponsor)) = sponsor_of.get(&current) else {
            break;
        };
        if !seen.insert(*sponsor) {
            warn!(user_id, sponsor = *sponsor, "sponsor cycle detected");
            break;
        }
        rows.push((*sponsor, depth));
        current = *sponsor;
    }
    rows
}

/// Links that should exist for the given active users but don't.
pub fn missing_links(
    active_users: &[i64],
    sponsor_of: &HashMap<i64, Option<i64>>,
    existing: &HashSet<(i64, i64)>,
    max_depth: u8,
) -> Vec<HierarchyLink> {
    active_users
        .iter()
        .flat_map(|user_id| {
            closure_from_sponsors(*user_id, sponsor_of, max_depth)
                .into_iter()
                .filter(|(ancestor, _)| !existing.contains(&(*ancestor, *user_id)))
                .map(|(ancestor, depth)| HierarchyLink {
                    ancestor_id: ancestor,
                    descendant_id: *user_id,
                    depth: i32::from(depth),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

async fn insert_links(tx: &mut Transaction<'_, Postgres>, links: &[HierarchyLink]) -> Result<u64> {
    if links.is_empty() {
        return Ok(0);
    }
    let ancestors: Vec<i64> = links.iter().map(|l| l.ancestor_id).collect();
    let descendants: Vec<i64> = links.iter().map(|l| l.descendant_id).collect();
    let depths: Vec<i32> = links.iter().map(|l| l.depth).collect();

    let res = sqlx::query(
        r#"INSERT INTO hierarchy (ancestor_id, descendant_id, depth)
           SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::INT[])
           ON CONFLICT (ancestor_id, descendant_id) DO NOTHING"#,
    )
    .bind(ancestors)
    .bind(descendants)
    .bind(depths)
    .execute(tx.as_mut())
    .await?;
    Ok(res.rows_affected())
}

/// Sponsor chain of `user_id` read straight from `users.sponsor_id`.
async fn sponsor_chain(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
) -> Result<HashMap<i64, Option<i64>>> {
    let rows = sqlx::query_as::<_, (i64, Option<i64>)>(
        r#"WITH RECURSIVE chain (id, sponsor_id, depth) AS (
               SELECT id, sponsor_id, 0 FROM users WHERE id = $1
               UNION ALL
               SELECT u.id, u.sponsor_id, c.depth + 1
               FROM chain c JOIN users u ON u.id = c.sponsor_id
               WHERE c.depth < $2
           )
           SELECT id, sponsor_id FROM chain"#,
    )
    .bind(user_id)
    .bind(i32::from(MAX_DEPTH))
    .fetch_all(tx.as_mut())
    .await?;
    Ok(rows.into_iter().collect())
}

/// Inserts `user_id` below `sponsor_id`. Idempotent.
///
/// Normally the new rows come from the sponsor's closure rows. A sponsor that
/// has a sponsor of its own but no rows was never placed; in that case the
/// chain is walked from `users` instead.
pub async fn place(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    sponsor_id: Option<i64>,
) -> Result<u64> {
    let Some(sponsor_id) = sponsor_id else {
        return Ok(0);
    };

    let sponsor_rows = sqlx::query_as::<_, (i64, i32)>(
        r#"SELECT ancestor_id, depth FROM hierarchy WHERE descendant_id = $1"#,
    )
    .bind(sponsor_id)
    .fetch_all(tx.as_mut())
    .await?;

    let sponsor_has_sponsor = sqlx::query_scalar::<_, Option<i64>>(
        r#"SELECT sponsor_id FROM users WHERE id = $1"#,
    )
    .bind(sponsor_id)
    .fetch_optional(tx.as_mut())
    .await?
    .flatten()
    .is_some();

    let rows = if sponsor_rows.is_empty() && sponsor_has_sponsor {
        warn!(user_id, sponsor_id, "sponsor missing from hierarchy, walking sponsor chain");
        let chain = sponsor_chain(tx, user_id).await?;
        closure_from_sponsors(user_id, &chain, MAX_DEPTH)
    } else {
        let sponsor_rows: Vec<(i64, u8)> = sponsor_rows
            .into_iter()
            .filter_map(|(a, d)| u8::try_from(d).ok().map(|d| (a, d)))
            .collect();
        closure_for(sponsor_id, &sponsor_rows, MAX_DEPTH)
    };

    let links: Vec<HierarchyLink> = rows
        .into_iter()
        .map(|(ancestor, depth)| HierarchyLink {
            ancestor_id: ancestor,
            descendant_id: user_id,
            depth: i32::from(depth),
        })
        .collect();
    insert_links(tx, &links).await
}

/// Ancestors of `user_id`, nearest first.
pub async fn ancestors(tx: &mut Transaction<'_, Postgres>, user_id: i64) -> Result<Vec<Ancestor>> {
    let rows = sqlx::query_as::<_, (i64, i32, bool)>(
        r#"SELECT h.ancestor_id, h.depth, u.is_active
           FROM hierarchy h JOIN users u ON u.id = h.ancestor_id
           WHERE h.descendant_id = $1 AND h.depth <= $2
           ORDER BY h.depth"#,
    )
    .bind(user_id)
    .bind(i32::from(MAX_DEPTH))
    .fetch_all(tx.as_mut())
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(user_id, depth, is_active)| {
            Some(Ancestor {
                user_id,
                depth: u8::try_from(depth).ok()?,
                is_active,
            })
        })
        .collect())
}

/// Downline size per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct LevelCount {
    pub depth: i32,
    pub members: i64,
}

pub async fn downline(pool: &PgPool, user_id: i64) -> Result<Vec<LevelCount>> {
    let rows = sqlx::query_as::<_, LevelCount>(
        r#"SELECT depth, COUNT(*)::BIGINT AS members
           FROM hierarchy WHERE ancestor_id = $1
           GROUP BY depth ORDER BY depth"#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub scanned: usize,
    pub inserted: u64,
}

/// Restores closure rows for active users whose placement is incomplete,
/// e.g. because their sponsor activated after they did. Never deletes rows.
#[instrument(skip(pool))]
pub async fn repair_orphans(pool: &PgPool) -> Result<RepairReport> {
    let mut tx = pool.begin().await?;

    let users = sqlx::query_as::<_, (i64, Option<i64>, bool)>(
        r#"SELECT id, sponsor_id, is_active FROM users"#,
    )
    .fetch_all(tx.as_mut())
    .await?;

    let existing: HashSet<(i64, i64)> = sqlx::query_as::<_, (i64, i64)>(
        r#"SELECT ancestor_id, descendant_id FROM hierarchy"#,
    )
    .fetch_all(tx.as_mut())
    .await?
    .into_iter()
    .collect();

    let sponsor_of: HashMap<i64, Option<i64>> =
        users.iter().map(|(id, sponsor, _)| (*id, *sponsor)).collect();
    let active: Vec<i64> = users
        .iter()
        .filter(|(_, _, is_active)| *is_active)
        .map(|(id, _, _)| *id)
        .collect();

    let links = missing_links(&active, &sponsor_of, &existing, MAX_DEPTH);
    let inserted = insert_links(&mut tx, &links).await?;
    tx.commit().await?;

    if inserted > 0 {
        warn!(inserted, "repaired orphaned hierarchy links");
    } else {
        info!(scanned = active.len(), "hierarchy is consistent");
    }
    Ok(RepairReport {
        scanned: active.len(),
        inserted,
    })
}
