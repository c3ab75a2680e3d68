use retask::task::query::Query;
use sqlx::{Postgres, QueryBuilder};

use crate::types::TaskStatus;

/// Columns of a task row, with its dependencies in the order they were added.
const TASK_COLUMNS: &str = r#"
    t.id,
    t.name,
    t.status,
    t.priority,
    t.queue,
    t.arguments,
    t.created_at,
    t.scheduled_at,
    t.started_at,
    t.completed_at,
    t.timeout,
    t.attempts,
    t.max_retries,
    t.worker_id,
    ARRAY(
        SELECT d.depends_on FROM retask_task_dependencies d
        WHERE d.task_id = t.id
        ORDER BY d.seq
    ) AS dependencies,
    t.last_errors,
    t.autoretry,
    t.retry_delay,
    t.retry_backoff,
    t.archived"#;

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Postgres>;
}

impl ToQuery for Query<'_> {
    fn query(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new("SELECT");
        builder.push(TASK_COLUMNS);
        builder.push(" FROM retask_tasks t WHERE");
        handle_query(&mut builder, self);
        builder.push(" ORDER BY t.created_at, t.seq");
        builder
    }
}

fn handle_query<'a>(builder: &mut QueryBuilder<'a, Postgres>, query: &'a Query<'_>) {
    match query {
        Query::Not(inner) => {
            builder.push(" NOT (");
            handle_query(builder, inner);
            builder.push(")");
        }
        Query::And(queries) => join(builder, queries, " AND", " TRUE"),
        Query::Or(queries) => join(builder, queries, " OR", " FALSE"),
        Query::IdEquals(id) => {
            builder.push(" t.id = ");
            builder.push_bind(uuid::Uuid::from(*id));
        }
        Query::IdIn(ids) => {
            let ids: Vec<uuid::Uuid> = ids.iter().map(|id| uuid::Uuid::from(*id)).collect();
            builder.push(" t.id = ANY(");
            builder.push_bind(ids);
            builder.push(")");
        }
        Query::NameEqual(name) => {
            builder.push(" t.name = ");
            builder.push_bind(*name);
        }
        Query::QueueEqual(queue) => {
            builder.push(" t.queue = ");
            builder.push_bind(*queue);
        }
        Query::StatusEqual(status) => {
            builder.push(" t.status = ");
            builder.push_bind(TaskStatus::from(*status));
        }
        Query::PriorityEqual(priority) => {
            builder.push(" t.priority = ");
            builder.push_bind(*priority);
        }
        Query::PriorityAtLeast(priority) => {
            builder.push(" t.priority >= ");
            builder.push_bind(*priority);
        }
        Query::Archived(archived) => {
            builder.push(" t.archived = ");
            builder.push_bind(*archived);
        }
    }
}

fn join<'a>(
    builder: &mut QueryBuilder<'a, Postgres>,
    queries: &'a [Query<'_>],
    separator: &str,
    empty: &str,
) {
    let Some((last, elements)) = queries.split_last() else {
        builder.push(empty);
        return;
    };
    builder.push(" (");
    elements.iter().for_each(|query| {
        handle_query(builder, query);
        builder.push(separator);
    });
    handle_query(builder, last);
    builder.push(")");
}

#[cfg(test)]
mod test {
    use retask::task::{query::Where, TaskId, TaskStatus};

    use super::*;

    fn where_clause(query: Query<'_>) -> String {
        let sql = query.query().into_sql();
        let start = sql.find(" FROM retask_tasks t WHERE").unwrap();
        sql[start..]
            .trim_start_matches(" FROM retask_tasks t WHERE")
            .trim_end_matches(" ORDER BY t.created_at, t.seq")
            .to_owned()
    }

    #[test]
    fn empty_conjunction_matches_everything() {
        assert_eq!(where_clause(Query::And(vec![])), " TRUE");
        assert_eq!(where_clause(Query::Or(vec![])), " FALSE");
    }

    #[test]
    fn nested_queries_are_parenthesised() {
        let query = Where::status_equal(TaskStatus::Failed)
            .and(Where::priority_at_least(3).or(Where::name_equal("report")))
            .and(!Where::archived(true));

        assert_eq!(
            where_clause(query.into()),
            " ( t.status = $1 AND ( t.priority >= $2 OR t.name = $3) AND NOT ( t.archived = $4))"
        );
    }

    #[test]
    fn id_in_binds_an_array() {
        let ids = [TaskId::from(uuid::Uuid::new_v4())];

        assert_eq!(where_clause(Query::IdIn(&ids)), " t.id = ANY($1)");
    }
}
