use std::collections::BTreeMap;
use std::ops::Bound;

use super::JobStore;
use crate::types::job::{JobId, JobRecord};
use crate::types::states::JobState;

/// Narrows a listing down to one queue and/or one state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ListFilter {
    pub queue: Option<String>,
    pub state: Option<JobState>,
}

impl ListFilter {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        self.queue.as_ref().map_or(true, |q| *q == job.queue_name)
            && self.state.map_or(true, |s| s == job.state)
    }
}

#[derive(Debug)]
pub struct Page {
    pub jobs: Vec<JobRecord>,
    /// Pass as `after` to get the following page; None on the last page.
    pub next: Option<JobId>,
}

/// Ids are handed out in creation order, so paging by id is paging by
/// `(created_at, id)` and stays stable while jobs are added or pruned.
pub(super) fn page(
    jobs: &BTreeMap<JobId, JobRecord>,
    filter: &ListFilter,
    after: Option<JobId>,
    limit: usize,
) -> Page {
    // An empty page would read as the end of the listing.
    let limit = limit.max(1);
    let start = after.map_or(Bound::Unbounded, Bound::Excluded);

    let mut matching = jobs
        .range((start, Bound::Unbounded))
        .map(|(_, job)| job)
        .filter(|job| filter.matches(job));

    let jobs: Vec<JobRecord> = matching.by_ref().take(limit).cloned().collect();
    let next = match (jobs.last(), matching.next()) {
        (Some(last), Some(_)) => Some(last.id),
        _ => None,
    };

    Page { jobs, next }
}

/// A lazy, restartable walk over the store, one page at a time. The store is
/// only locked while a page is being collected.
pub struct Listing<'a> {
    store: &'a JobStore,
    filter: ListFilter,
    cursor: Option<JobId>,
    page_size: usize,
    done: bool,
}

impl<'a> Listing<'a> {
    pub(super) fn new(
        store: &'a JobStore,
        filter: ListFilter,
        cursor: Option<JobId>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            filter,
            cursor,
            page_size: page_size.max(1),
            done: false,
        }
    }

    /// Fetches the next page, or None once the listing is exhausted.
    pub async fn next_page(&mut self) -> Option<Vec<JobRecord>> {
        if self.done {
            return None;
        }

        let page = self
            .store
            .list(&self.filter, self.cursor, self.page_size)
            .await;

        match page.next {
            Some(next) => self.cursor = Some(next),
            None => self.done = true,
        }

        if page.jobs.is_empty() {
            None
        } else {
            Some(page.jobs)
        }
    }

    /// Last id handed out; feed it to `JobStore::listing_from` to pick up
    /// where this listing stopped.
    pub fn cursor(&self) -> Option<JobId> {
        self.cursor
    }
}
