use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// 2-decimal rounding used for all published averages:
/// `Int(100*x + 0.5) / 100`. Ratings are non-negative, so half-up and
/// half-away-from-zero coincide.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StatsError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

fn db_err(e: rusqlite::Error) -> StatsError {
    StatsError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherStats {
    pub teacher_id: String,
    pub avg_overall: f64,
    pub avg_knowledge: f64,
    pub avg_communication: f64,
    pub avg_punctuality: f64,
    pub total_feedbacks: i64,
    pub computed_at: String,
}

/// Full recomputation of the cached per-teacher aggregate from the live
/// feedback rows, upserted in one statement. Pure function of ledger state;
/// idempotent. Callers run it inside the same transaction as the ledger
/// mutation that made it necessary.
pub fn recompute_teacher_stats(
    conn: &Connection,
    teacher_id: &str,
) -> Result<TeacherStats, StatsError> {
    let mut stmt = conn
        .prepare(
            "SELECT f.rating_overall, f.rating_knowledge, f.rating_communication, f.rating_punctuality
             FROM feedbacks f
             JOIN teacher_assignments ta ON ta.id = f.assignment_id
             WHERE ta.teacher_id = ?",
        )
        .map_err(db_err)?;

    let rows = stmt
        .query_map([teacher_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let count = rows.len() as i64;
    let mut sums = [0.0_f64; 4];
    for (overall, knowledge, communication, punctuality) in &rows {
        sums[0] += *overall as f64;
        sums[1] += *knowledge as f64;
        sums[2] += *communication as f64;
        sums[3] += *punctuality as f64;
    }
    // A teacher with no feedback reports 0.00 everywhere, never NULL.
    let avg = |sum: f64| {
        if count > 0 {
            round_off_2_decimals(sum / count as f64)
        } else {
            0.0
        }
    };

    let stats = TeacherStats {
        teacher_id: teacher_id.to_string(),
        avg_overall: avg(sums[0]),
        avg_knowledge: avg(sums[1]),
        avg_communication: avg(sums[2]),
        avg_punctuality: avg(sums[3]),
        total_feedbacks: count,
        computed_at: chrono::Utc::now().to_rfc3339(),
    };

    conn.execute(
        "INSERT INTO teacher_stats(teacher_id, avg_overall, avg_knowledge,
           avg_communication, avg_punctuality, total_feedbacks, computed_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(teacher_id) DO UPDATE SET
           avg_overall = excluded.avg_overall,
           avg_knowledge = excluded.avg_knowledge,
           avg_communication = excluded.avg_communication,
           avg_punctuality = excluded.avg_punctuality,
           total_feedbacks = excluded.total_feedbacks,
           computed_at = excluded.computed_at",
        (
            &stats.teacher_id,
            stats.avg_overall,
            stats.avg_knowledge,
            stats.avg_communication,
            stats.avg_punctuality,
            stats.total_feedbacks,
            &stats.computed_at,
        ),
    )
    .map_err(|e| StatsError::new("db_insert_failed", e.to_string()))?;

    Ok(stats)
}

/// Cached aggregate read. Teachers whose cache row has not been created yet
/// (no ledger mutation so far) report zeros; the row appears on first write.
pub fn cached_teacher_stats(
    conn: &Connection,
    teacher_id: &str,
) -> Result<TeacherStats, StatsError> {
    let found = conn
        .query_row(
            "SELECT avg_overall, avg_knowledge, avg_communication, avg_punctuality,
                    total_feedbacks, computed_at
             FROM teacher_stats WHERE teacher_id = ?",
            [teacher_id],
            |r| {
                Ok(TeacherStats {
                    teacher_id: teacher_id.to_string(),
                    avg_overall: r.get(0)?,
                    avg_knowledge: r.get(1)?,
                    avg_communication: r.get(2)?,
                    avg_punctuality: r.get(3)?,
                    total_feedbacks: r.get(4)?,
                    computed_at: r.get(5)?,
                })
            },
        )
        .optional()
        .map_err(db_err)?;

    Ok(found.unwrap_or(TeacherStats {
        teacher_id: teacher_id.to_string(),
        avg_overall: 0.0,
        avg_knowledge: 0.0,
        avg_communication: 0.0,
        avg_punctuality: 0.0,
        total_feedbacks: 0,
        computed_at: String::new(),
    }))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryFilters {
    pub branch_id: Option<String>,
    pub year_id: Option<String>,
    pub semester_id: Option<String>,
}

pub fn parse_summary_filters(raw: &serde_json::Value) -> Result<SummaryFilters, StatsError> {
    let Some(obj) = raw.as_object() else {
        return Err(StatsError::new("bad_params", "params must be an object"));
    };

    let mut out = SummaryFilters::default();
    for (key, slot) in [
        ("branchId", &mut out.branch_id),
        ("yearId", &mut out.year_id),
        ("semesterId", &mut out.semester_id),
    ] {
        match obj.get(key) {
            None => {}
            Some(v) if v.is_null() => {}
            Some(v) => {
                let Some(s) = v.as_str() else {
                    return Err(StatsError::new(
                        "bad_params",
                        format!("{} must be a string or null", key),
                    ));
                };
                let t = s.trim();
                if !t.is_empty() {
                    *slot = Some(t.to_string());
                }
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherSummary {
    pub teacher_id: String,
    pub name: String,
    pub total_feedbacks: i64,
    pub avg_overall: f64,
    pub avg_knowledge: f64,
    pub avg_communication: f64,
    pub avg_punctuality: f64,
}

/// On-demand, filterable summary aggregated live from the ledger (never from
/// the cache). Each present filter restricts; absent filters match all.
pub fn compute_teacher_summary(
    conn: &Connection,
    teacher_id: &str,
    filters: &SummaryFilters,
) -> Result<TeacherSummary, StatsError> {
    let name: Option<String> = conn
        .query_row(
            "SELECT first_name || ' ' || COALESCE(last_name, '') FROM teachers WHERE id = ?",
            [teacher_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(name) = name else {
        return Err(StatsError::new("not_found", "teacher not found"));
    };

    let mut sql = String::from(
        "SELECT f.rating_overall, f.rating_knowledge, f.rating_communication, f.rating_punctuality
         FROM feedbacks f
         JOIN teacher_assignments ta ON ta.id = f.assignment_id
         WHERE ta.teacher_id = ?",
    );
    let mut params: Vec<Value> = vec![Value::Text(teacher_id.to_string())];
    if let Some(b) = &filters.branch_id {
        sql.push_str(" AND ta.branch_id = ?");
        params.push(Value::Text(b.clone()));
    }
    if let Some(y) = &filters.year_id {
        sql.push_str(" AND ta.year_id = ?");
        params.push(Value::Text(y.clone()));
    }
    if let Some(s) = &filters.semester_id {
        sql.push_str(" AND ta.semester_id = ?");
        params.push(Value::Text(s.clone()));
    }

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params_from_iter(params), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let count = rows.len() as i64;
    let mut sums = [0.0_f64; 4];
    for (overall, knowledge, communication, punctuality) in &rows {
        sums[0] += *overall as f64;
        sums[1] += *knowledge as f64;
        sums[2] += *communication as f64;
        sums[3] += *punctuality as f64;
    }
    let avg = |sum: f64| {
        if count > 0 {
            round_off_2_decimals(sum / count as f64)
        } else {
            0.0
        }
    };

    Ok(TeacherSummary {
        teacher_id: teacher_id.to_string(),
        name: name.trim().to_string(),
        total_feedbacks: count,
        avg_overall: avg(sums[0]),
        avg_knowledge: avg(sums[1]),
        avg_communication: avg(sums[2]),
        avg_punctuality: avg(sums[3]),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopTeacherRow {
    pub teacher_id: String,
    pub name: String,
    pub avg_overall_rating: f64,
    pub total_feedbacks: i64,
}

/// Leaderboard over the cache: rated teachers only, best average first,
/// feedback count as tiebreak.
pub fn top_teachers(conn: &Connection, limit: i64) -> Result<Vec<TopTeacherRow>, StatsError> {
    let mut stmt = conn
        .prepare(
            "SELECT ts.teacher_id,
                    t.first_name || ' ' || COALESCE(t.last_name, ''),
                    ts.avg_overall, ts.total_feedbacks
             FROM teacher_stats ts
             JOIN teachers t ON t.id = ts.teacher_id
             WHERE ts.total_feedbacks > 0
             ORDER BY ts.avg_overall DESC, ts.total_feedbacks DESC
             LIMIT ?",
        )
        .map_err(db_err)?;

    stmt.query_map([limit], |r| {
        let name: String = r.get(1)?;
        Ok(TopTeacherRow {
            teacher_id: r.get(0)?,
            name: name.trim().to_string(),
            avg_overall_rating: r.get(2)?,
            total_feedbacks: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRankRow {
    pub branch_id: String,
    pub year_id: String,
    pub semester_id: String,
    pub teacher_id: String,
    pub name: String,
    pub avg_overall: f64,
    pub rank_in_group: i64,
}

/// Per (branch, year, semester) group, each teacher's live average overall
/// rating and standard competition rank within the group (ties share a rank,
/// the next rank skips).
pub fn rank_within_groups(
    conn: &Connection,
    branch_id: Option<&str>,
) -> Result<Vec<GroupRankRow>, StatsError> {
    let mut sql = String::from(
        "SELECT ta.branch_id, ta.year_id, ta.semester_id, ta.teacher_id,
                t.first_name || ' ' || COALESCE(t.last_name, ''),
                AVG(f.rating_overall)
         FROM feedbacks f
         JOIN teacher_assignments ta ON ta.id = f.assignment_id
         JOIN teachers t ON t.id = ta.teacher_id",
    );
    let mut params: Vec<Value> = Vec::new();
    if let Some(b) = branch_id {
        sql.push_str(" WHERE ta.branch_id = ?");
        params.push(Value::Text(b.to_string()));
    }
    sql.push_str(
        " GROUP BY ta.branch_id, ta.year_id, ta.semester_id, ta.teacher_id
          ORDER BY ta.branch_id, ta.year_id, ta.semester_id",
    );

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let mut rows = stmt
        .query_map(params_from_iter(params), |r| {
            let name: String = r.get(4)?;
            let avg: f64 = r.get(5)?;
            Ok(GroupRankRow {
                branch_id: r.get(0)?,
                year_id: r.get(1)?,
                semester_id: r.get(2)?,
                teacher_id: r.get(3)?,
                name: name.trim().to_string(),
                avg_overall: round_off_2_decimals(avg),
                rank_in_group: 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    rows.sort_by(|a, b| {
        (&a.branch_id, &a.year_id, &a.semester_id)
            .cmp(&(&b.branch_id, &b.year_id, &b.semester_id))
            .then(
                b.avg_overall
                    .partial_cmp(&a.avg_overall)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.teacher_id.cmp(&b.teacher_id))
    });
    assign_group_ranks(&mut rows);
    Ok(rows)
}

/// Rows must already be sorted by group, then average descending.
fn assign_group_ranks(rows: &mut [GroupRankRow]) {
    let mut i = 0;
    while i < rows.len() {
        let group = (
            rows[i].branch_id.clone(),
            rows[i].year_id.clone(),
            rows[i].semester_id.clone(),
        );
        let start = i;
        let mut rank = 1_i64;
        let mut prev_avg: Option<f64> = None;
        while i < rows.len()
            && (rows[i].branch_id.as_str(), rows[i].year_id.as_str(), rows[i].semester_id.as_str())
                == (group.0.as_str(), group.1.as_str(), group.2.as_str())
        {
            let pos = (i - start) as i64 + 1;
            if prev_avg != Some(rows[i].avg_overall) {
                rank = pos;
                prev_avg = Some(rows[i].avg_overall);
            }
            rows[i].rank_in_group = rank;
            i += 1;
        }
    }
}
