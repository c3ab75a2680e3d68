use crate::task::{query::Query, Task};

pub(super) trait Queryable {
    fn matches(&self, task: &Task) -> bool;
}

impl<'a> Queryable for Query<'a> {
    fn matches(&self, task: &Task) -> bool {
        match self {
            Query::Not(inner) => !inner.matches(task),
            Query::And(inner) => inner.iter().all(|query| query.matches(task)),
            Query::Or(inner) => inner.iter().any(|query| query.matches(task)),
            Query::IdEquals(id) => task.id == *id,
            Query::IdIn(ids) => ids.contains(&task.id),
            Query::NameEqual(name) => task.name == *name,
            Query::QueueEqual(queue) => task.queue == *queue,
            Query::StatusEqual(status) => task.status == *status,
            Query::PriorityEqual(priority) => task.priority == *priority,
            Query::PriorityAtLeast(priority) => task.priority >= *priority,
            Query::Archived(archived) => task.archived == *archived,
        }
    }
}
