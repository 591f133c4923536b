//! Incremental path search driven by the caller
//!
//! The sliced search runs the same iterations as
//! [`NavMeshQuery::find_path`], a bounded number at a time, so a long search
//! can be spread over several frames. Draining it yields exactly the
//! corridor `find_path` returns for the same inputs.

use crate::nav_mesh_query::{NavMeshQuery, PathResult, SearchState, SearchStep};
use crate::node_pool::NodePool;
use crate::query_filter::QueryFilter;
use crate::{PolyRef, Result, Status};

/// State of the sliced search of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum SlicedStatus {
    /// No search has been started
    #[default]
    Uninitialized,
    InProgress,
    /// The end polygon was reached
    Complete,
    /// The open list ran dry before reaching the end polygon
    Partial,
}

#[derive(Debug)]
pub(crate) struct SlicedSearch {
    state: Option<SearchState>,
    start_ref: PolyRef,
    filter: Box<dyn QueryFilter>,
    status: SlicedStatus,
}

impl<'a> NavMeshQuery<'a> {
    /// Starts a sliced search, replacing any search in flight
    pub fn init_sliced_find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
    ) -> Result<SlicedStatus> {
        self.sliced = None;
        if !self.nav_mesh.is_valid_poly_ref(start_ref) || !self.nav_mesh.is_valid_poly_ref(end_ref) {
            return Err(Status::InvalidParam);
        }

        let (state, status) = if start_ref == end_ref {
            (None, SlicedStatus::Complete)
        } else {
            // Own pool, so queries run between updates cannot disturb it
            let pool = NodePool::new(self.max_nodes());
            let state = SearchState::new(pool, start_ref, end_ref, start_pos, end_pos);
            (Some(state), SlicedStatus::InProgress)
        };
        self.sliced = Some(SlicedSearch {
            state,
            start_ref,
            filter: filter.clone_box(),
            status,
        });
        Ok(status)
    }

    /// Runs up to `max_iter` search iterations. Returns the number actually
    /// performed, zero once the search has finished.
    pub fn update_sliced_find_path(&mut self, max_iter: usize) -> Result<(usize, SlicedStatus)> {
        let mut sliced = self.sliced.take().ok_or(Status::InvalidParam)?;
        let mut done = 0;

        if sliced.status == SlicedStatus::InProgress {
            if let Some(state) = sliced.state.as_mut() {
                while done < max_iter {
                    done += 1;
                    match self.search_step(state, sliced.filter.as_ref()) {
                        SearchStep::Continue => {}
                        SearchStep::Reached => {
                            sliced.status = SlicedStatus::Complete;
                            break;
                        }
                        SearchStep::Exhausted => {
                            sliced.status = SlicedStatus::Partial;
                            break;
                        }
                    }
                }
            }
        }

        let status = sliced.status;
        self.sliced = Some(sliced);
        Ok((done, status))
    }

    /// Builds the corridor of the current search and ends it. A search that
    /// is still in progress yields the best partial corridor so far.
    pub fn finalize_sliced_find_path(&mut self, max_path: usize) -> Result<PathResult> {
        let sliced = self.sliced.take().ok_or(Status::InvalidParam)?;
        match (&sliced.state, sliced.status) {
            (_, SlicedStatus::Uninitialized) => Err(Status::InvalidParam),
            (None, _) => Ok(PathResult {
                path: vec![sliced.start_ref],
                status: Status::Success,
            }),
            (Some(state), status) => {
                let mut result = self.search_result(state, max_path);
                if status == SlicedStatus::InProgress {
                    result.status = Status::PartialResult;
                }
                Ok(result)
            }
        }
    }

    pub fn sliced_status(&self) -> SlicedStatus {
        self.sliced.as_ref().map_or(SlicedStatus::Uninitialized, |s| s.status)
    }
}
