use super::{TaskId, TaskStatus};

/// A composable filter over stored tasks.
///
/// ```
/// # use retask::prelude::*;
/// let query = Where::status_equal(TaskStatus::Failed)
///     .and(Where::priority_at_least(Priority::High.into()))
///     .and(!Where::archived(true));
/// ```
#[derive(Debug, PartialEq, Clone)]
#[non_exhaustive]
pub struct Where<'a>(pub(crate) Query<'a>);

#[derive(Debug, PartialEq, Clone)]
pub enum Query<'a> {
    Not(Box<Query<'a>>),
    And(Vec<Query<'a>>),
    Or(Vec<Query<'a>>),
    IdEquals(TaskId),
    IdIn(&'a [TaskId]),
    NameEqual(&'a str),
    QueueEqual(&'a str),
    StatusEqual(TaskStatus),
    PriorityEqual(i32),
    PriorityAtLeast(i32),
    Archived(bool),
}

impl<'a> Where<'a> {
    pub fn and(mut self, other: Where<'a>) -> Self {
        if let Query::And(ref mut constraints) = self.0 {
            constraints.push(other.0);
        } else {
            self.0 = Query::And(vec![self.0, other.0]);
        }
        self
    }

    pub fn or(mut self, other: Where<'a>) -> Self {
        if let Query::Or(ref mut constraints) = self.0 {
            constraints.push(other.0);
        } else {
            self.0 = Query::Or(vec![self.0, other.0]);
        }
        self
    }

    pub fn id_equals(id: TaskId) -> Self {
        Self(Query::IdEquals(id))
    }

    pub fn id_in(ids: &'a [TaskId]) -> Self {
        Self(Query::IdIn(ids))
    }

    pub fn name_equal(name: &'a str) -> Self {
        Self(Query::NameEqual(name))
    }

    pub fn queue_equal(queue: &'a str) -> Self {
        Self(Query::QueueEqual(queue))
    }

    pub fn status_equal(status: TaskStatus) -> Self {
        Self(Query::StatusEqual(status))
    }

    pub fn priority_equal(priority: i32) -> Self {
        Self(Query::PriorityEqual(priority))
    }

    pub fn priority_at_least(priority: i32) -> Self {
        Self(Query::PriorityAtLeast(priority))
    }

    pub fn archived(archived: bool) -> Self {
        Self(Query::Archived(archived))
    }
}

impl<'a> std::ops::Not for Where<'a> {
    type Output = Self;
    fn not(self) -> Self {
        Self(Query::Not(Box::new(self.0)))
    }
}

impl<'a> From<Where<'a>> for Query<'a> {
    fn from(value: Where<'a>) -> Self {
        value.0
    }
}
