use crate::WorkflowStatus;

/// Filter for listing instance headers.
///
/// Results are ordered by creation time (oldest first).
#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    /// Filter by workflow definition identifier.
    pub definition_id: Option<String>,

    /// Filter by status (any of these).
    pub statuses: Option<Vec<WorkflowStatus>>,

    /// Maximum number of headers to return.
    pub limit: Option<usize>,

    /// Number of headers to skip.
    pub offset: Option<usize>,
}

impl InstanceQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for instances that still need driving.
    pub fn unfinished() -> Self {
        Self::new().statuses(vec![WorkflowStatus::Running, WorkflowStatus::Compensating])
    }

    /// Filters by definition identifier.
    pub fn definition_id(mut self, definition_id: impl Into<String>) -> Self {
        self.definition_id = Some(definition_id.into());
        self
    }

    /// Filters by a single status.
    pub fn status(mut self, status: WorkflowStatus) -> Self {
        self.statuses = Some(vec![status]);
        self
    }

    /// Filters by several statuses (any of these).
    pub fn statuses(mut self, statuses: Vec<WorkflowStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    /// Limits the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `offset` results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if the header passes the definition and status filters.
    pub fn matches(&self, definition_id: &str, status: WorkflowStatus) -> bool {
        if let Some(ref id) = self.definition_id
            && id != definition_id
        {
            return false;
        }
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&status)
        {
            return false;
        }
        true
    }
}
