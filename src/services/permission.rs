// src/services/permission.rs
//
// Row-level visibility. Pure over the actor's permission rows; the SQL fragment it renders guards
// every read of report rows on behalf of a user, listings and per-process totals alike.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, Postgres, QueryBuilder};

use crate::error::{CoreError, CoreResult};
use crate::models::{PermissionType, ReportSource, UserWorkPermission};

/// Identity forwarded by the upstream auth gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub username: String,
    pub is_superuser: bool,
}

impl Actor {
    pub fn user(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_superuser: false,
        }
    }

    pub fn superuser(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_superuser: true,
        }
    }

    /// Identity stamped on rows written by periodic tasks.
    pub fn system(task: &str) -> Self {
        Self::superuser(format!("system:{task}"))
    }

    pub fn require_superuser(&self) -> CoreResult<()> {
        if self.is_superuser {
            Ok(())
        } else {
            Err(CoreError::denied(format!(
                "{} is not allowed to run admin operations",
                self.username
            )))
        }
    }
}

/// One permission row reduced to its restrictions. An empty list means "any".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub operators: Vec<String>,
    pub processes: Vec<String>,
}

impl Grant {
    fn permits(&self, operator: &str, process: &str) -> bool {
        let operator_ok = self.operators.is_empty() || self.operators.iter().any(|o| o == operator);
        let process_ok = self.processes.is_empty() || self.processes.iter().any(|p| p == process);
        operator_ok && process_ok
    }

    fn is_unrestricted(&self) -> bool {
        self.operators.is_empty() && self.processes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    /// A row is visible when any grant permits it.
    Grants(Vec<Grant>),
    Denied,
}

impl Scope {
    pub fn permits(&self, operator: &str, process: &str) -> bool {
        match self {
            Self::All => true,
            Self::Grants(grants) => grants.iter().any(|g| g.permits(operator, process)),
            Self::Denied => false,
        }
    }
}

/// Scope of `actor` for one permission kind, from their active rows.
pub fn scope_for(actor: &Actor, rows: &[UserWorkPermission], wanted: PermissionType) -> Scope {
    if actor.is_superuser {
        return Scope::All;
    }

    let grants: Vec<Grant> = rows
        .iter()
        .filter(|row| row.is_active && row.username == actor.username)
        .filter(|row| row.permission_type.grants(wanted))
        .map(|row| Grant {
            operators: row.operator_list(),
            processes: row.process_list(),
        })
        .collect();

    if grants.is_empty() {
        Scope::Denied
    } else if grants.iter().any(Grant::is_unrestricted) {
        Scope::All
    } else {
        Scope::Grants(grants)
    }
}

/// Scopes for both permission kinds, resolved once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessScopes {
    pub fill_work: Scope,
    pub onsite: Scope,
}

impl AccessScopes {
    pub fn resolve(actor: &Actor, rows: &[UserWorkPermission]) -> Self {
        Self {
            fill_work: scope_for(actor, rows, PermissionType::FillWork),
            onsite: scope_for(actor, rows, PermissionType::OnsiteReporting),
        }
    }

    pub fn for_source(&self, source: ReportSource) -> &Scope {
        match source.permission() {
            PermissionType::OnsiteReporting => &self.onsite,
            _ => &self.fill_work,
        }
    }

    pub fn is_denied_everywhere(&self) -> bool {
        self.fill_work == Scope::Denied && self.onsite == Scope::Denied
    }

    /// Appends a boolean predicate over `source`, `operator_or_equipment` and `process_name`.
    pub fn push_predicate(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push("((source = 'onsite' AND ");
        push_scope(qb, &self.onsite);
        qb.push(") OR (source <> 'onsite' AND ");
        push_scope(qb, &self.fill_work);
        qb.push("))");
    }
}

fn push_scope(qb: &mut QueryBuilder<'_, Postgres>, scope: &Scope) {
    match scope {
        Scope::All => {
            qb.push("TRUE");
        }
        Scope::Denied => {
            qb.push("FALSE");
        }
        Scope::Grants(grants) => {
            qb.push("(");
            for (i, grant) in grants.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push("(");
                if grant.operators.is_empty() {
                    qb.push("TRUE");
                } else {
                    qb.push("operator_or_equipment = ANY(");
                    qb.push_bind(grant.operators.clone());
                    qb.push(")");
                }
                qb.push(" AND ");
                if grant.processes.is_empty() {
                    qb.push("TRUE");
                } else {
                    qb.push("process_name = ANY(");
                    qb.push_bind(grant.processes.clone());
                    qb.push(")");
                }
                qb.push(")");
            }
            qb.push(")");
        }
    }
}

/// Fails with `PermissionDenied` unless `actor` may touch a `source` report of `operator` on `process`.
pub fn check(
    actor: &Actor,
    rows: &[UserWorkPermission],
    source: ReportSource,
    operator: &str,
    process: &str,
) -> CoreResult<()> {
    if scope_for(actor, rows, source.permission()).permits(operator, process) {
        return Ok(());
    }
    Err(CoreError::denied(format!(
        "{} may not act on {source} reports for operator {operator} on process {process}",
        actor.username
    )))
}

pub async fn load_permissions(
    conn: &mut PgConnection,
    actor: &Actor,
) -> CoreResult<Vec<UserWorkPermission>> {
    if actor.is_superuser {
        return Ok(Vec::new());
    }
    let rows = sqlx::query_as::<_, UserWorkPermission>(
        r#"SELECT permission_id, username, permission_type, operator_codes, process_names,
                  is_active, created_at
           FROM system_user_work_permission
           WHERE username = $1 AND is_active"#,
    )
    .bind(&actor.username)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

/// Loads the actor's rows and checks one report against them.
pub async fn authorize(
    conn: &mut PgConnection,
    actor: &Actor,
    source: ReportSource,
    operator: &str,
    process: &str,
) -> CoreResult<()> {
    let rows = load_permissions(conn, actor).await?;
    check(actor, &rows, source, operator, process)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(kind: PermissionType, operators: &str, processes: &str) -> UserWorkPermission {
        UserWorkPermission {
            permission_id: 1,
            username: "lin".into(),
            permission_type: kind,
            operator_codes: operators.into(),
            process_names: processes.into(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn superuser_bypasses_all_rows() {
        let admin = Actor::superuser("root");
        assert_eq!(scope_for(&admin, &[], PermissionType::FillWork), Scope::All);
        assert!(check(&admin, &[], ReportSource::OnsiteLive, "X", "Y").is_ok());
    }

    #[test]
    fn no_applicable_rows_is_denied() {
        let lin = Actor::user("lin");
        let rows = [row(PermissionType::OnsiteReporting, "", "")];
        let err = check(&lin, &rows, ReportSource::SmtProduction, "OP-1", "SMT").unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied(_)));
        assert!(check(&lin, &rows, ReportSource::OnsiteLive, "OP-1", "SMT").is_ok());
    }

    #[test]
    fn operator_and_process_restrictions_intersect_within_a_row() {
        let lin = Actor::user("lin");
        let rows = [row(PermissionType::FillWork, "OP-1,OP-2", "SMT")];
        let scope = scope_for(&lin, &rows, PermissionType::FillWork);
        assert!(scope.permits("OP-1", "SMT"));
        assert!(!scope.permits("OP-3", "SMT"));
        assert!(!scope.permits("OP-1", "assembly"));
    }

    #[test]
    fn rows_are_unioned_and_empty_lists_mean_all() {
        let lin = Actor::user("lin");
        let rows = [
            row(PermissionType::FillWork, "OP-1", "SMT"),
            row(PermissionType::Both, "OP-9", ""),
        ];
        let scope = scope_for(&lin, &rows, PermissionType::FillWork);
        assert!(scope.permits("OP-1", "SMT"));
        assert!(scope.permits("OP-9", "inspection"));
        assert!(!scope.permits("OP-2", "SMT"));

        let open = [row(PermissionType::Both, "", "")];
        assert_eq!(scope_for(&lin, &open, PermissionType::OnsiteReporting), Scope::All);
    }

    #[test]
    fn inactive_or_foreign_rows_are_ignored() {
        let lin = Actor::user("lin");
        let mut inactive = row(PermissionType::FillWork, "", "");
        inactive.is_active = false;
        let mut foreign = row(PermissionType::FillWork, "", "");
        foreign.username = "chen".into();
        assert_eq!(
            scope_for(&lin, &[inactive, foreign], PermissionType::FillWork),
            Scope::Denied
        );
    }

    #[test]
    fn predicate_binds_each_restricted_list() {
        let lin = Actor::user("lin");
        let rows = [row(PermissionType::FillWork, "OP-1", "SMT,assembly")];
        let scopes = AccessScopes::resolve(&lin, &rows);
        assert!(!scopes.is_denied_everywhere());

        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 WHERE ");
        scopes.push_predicate(&mut qb);
        assert_eq!(
            qb.sql(),
            "SELECT 1 WHERE ((source = 'onsite' AND FALSE) OR (source <> 'onsite' AND \
             ((operator_or_equipment = ANY($1) AND process_name = ANY($2)))))"
        );
    }
}
