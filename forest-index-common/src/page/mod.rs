//! A decoded page: one coarse-octree leaf's points, loaded into memory
//! and carried through a fixed processing pipeline on the way to being
//! rendered for a query result or written back during a build.
//!
//! Every page moves through its pipeline states strictly forward -
//! `Empty -> Read -> Transform -> Select -> RunModifiers -> Render ->
//! Rendered` - never back. A page that only needs some of these stages
//! (an unselected page skips straight from `Read` to `Rendered` with an
//! empty selection) simply jumps ahead; what it may never do is revisit
//! a stage once past it, since later stages consume the previous stage's
//! output in place.

use crate::cache::CacheEntry;
use crate::error::{CoreError, PipelineStateError};
use crate::octree::NodeId;
use crate::point::{PointRecord, SideAttributes};
use std::mem::size_of;

/// A page's position in its processing pipeline. Declaration order is
/// significant: the derived [Ord] impl is exactly the allowed
/// advancement order that [Page::advance_to] enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    /// Allocated, but its points have not been loaded yet.
    Empty,
    /// Points and side attributes have been loaded from storage.
    Read,
    /// Any in-place point transform (e.g. a coordinate reprojection
    /// applied at query time) has run.
    Transform,
    /// The query's region/attribute predicates have been evaluated,
    /// producing a selection mask.
    Select,
    /// Any modifiers (segment/classification recomputation) that write
    /// back into the page's attributes have run.
    RunModifiers,
    /// The final point list for this page has been assembled from the
    /// selection mask.
    Render,
    /// Rendering is complete; the page is only held for caching.
    Rendered,
}

pub struct Page {
    id: NodeId,
    points: Vec<PointRecord>,
    attributes: Vec<SideAttributes>,
    selected: Vec<bool>,
    rendered: Vec<usize>,
    state: PipelineState,
    dirty: bool,
}

impl Page {
    pub fn new(id: NodeId) -> Self {
        Page {
            id,
            points: Vec::new(),
            attributes: Vec::new(),
            selected: Vec::new(),
            rendered: Vec::new(),
            state: PipelineState::Empty,
            dirty: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn points(&self) -> &[PointRecord] {
        &self.points
    }

    pub fn attributes(&self) -> &[SideAttributes] {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut [SideAttributes] {
        &mut self.attributes
    }

    /// Indices into [Page::points] selected by the most recent
    /// [Page::render] call. Only meaningful once `state() ==
    /// PipelineState::Rendered`.
    pub fn rendered(&self) -> &[usize] {
        &self.rendered
    }

    /// Moves the page backward to `to`, discarding whatever later-stage
    /// output that undoes (the selection mask past `Select`, the
    /// rendered index list past `Render`). A no-op if `to` is not
    /// strictly earlier than the current state. This is the one
    /// exception to `advance_to`'s forward-only rule (see the module
    /// docs): a caller re-running a page against a new query or camera
    /// resets it, it never advances past where a fresh `read` would
    /// leave it.
    pub fn reset_to(&mut self, to: PipelineState) {
        if to >= self.state {
            return;
        }
        if to < PipelineState::Select {
            self.selected.clear();
        }
        if to < PipelineState::Render {
            self.rendered.clear();
        }
        self.state = to;
    }

    /// Writes this page's current points and attributes back to
    /// `points`/`sides` over the ordinal range `[base, base + len())`,
    /// clearing the dirty flag. Used by eviction and explicit flush
    /// (see [crate::query::engine::QueryEngine]); a no-op if the page
    /// was never marked dirty.
    pub fn write_back(
        &mut self,
        base: u64,
        points: &mut crate::point::PointFile,
        sides: &mut crate::point::SideStream,
    ) -> Result<(), CoreError> {
        if !self.dirty {
            return Ok(());
        }
        for (i, (point, attrs)) in self.points.iter().zip(self.attributes.iter()).enumerate() {
            let ordinal = base + i as u64;
            points.write_point(ordinal, point)?;
            sides.write(ordinal, attrs)?;
        }
        self.dirty = false;
        Ok(())
    }

    fn advance_to(&mut self, to: PipelineState) -> Result<(), CoreError> {
        if to <= self.state {
            return Err(PipelineStateError {
                message: format!("cannot advance page from {:?} to {:?}", self.state, to),
            }
            .into());
        }
        self.state = to;
        Ok(())
    }

    /// Loads this page's points, moving it from `Empty` to `Read`.
    pub fn read(
        &mut self,
        points: Vec<PointRecord>,
        attributes: Vec<SideAttributes>,
    ) -> Result<(), CoreError> {
        debug_assert_eq!(points.len(), attributes.len());
        self.advance_to(PipelineState::Read)?;
        self.points = points;
        self.attributes = attributes;
        Ok(())
    }

    /// Applies an in-place transform to every point, moving the page to
    /// `Transform`. Marks the page dirty, since the transformed points
    /// differ from what is on disk.
    pub fn transform(&mut self, mut f: impl FnMut(&mut PointRecord)) -> Result<(), CoreError> {
        self.advance_to(PipelineState::Transform)?;
        for point in &mut self.points {
            f(point);
        }
        self.dirty = true;
        Ok(())
    }

    /// Records which points matched the query predicates, moving the
    /// page to `Select`.
    pub fn select(&mut self, mask: Vec<bool>) -> Result<(), CoreError> {
        debug_assert_eq!(mask.len(), self.points.len());
        self.advance_to(PipelineState::Select)?;
        self.selected = mask;
        Ok(())
    }

    /// Runs a modifier over every *selected* point/attribute pair (see
    /// [Page::select]), moving the page to `RunModifiers`. Modifiers
    /// write back into the side attributes (e.g. assigning
    /// `segment_id`), so this marks the page dirty whenever the
    /// selection was non-empty.
    pub fn run_modifiers(
        &mut self,
        mut f: impl FnMut(&PointRecord, &mut SideAttributes),
    ) -> Result<(), CoreError> {
        self.advance_to(PipelineState::RunModifiers)?;
        let mut touched = false;
        for ((point, attrs), selected) in self
            .points
            .iter()
            .zip(self.attributes.iter_mut())
            .zip(self.selected.iter())
        {
            if *selected {
                f(point, attrs);
                touched = true;
            }
        }
        if touched {
            self.dirty = true;
        }
        Ok(())
    }

    /// Assembles the final list of selected point indices, moving the
    /// page to `Render`, then immediately to `Rendered`.
    pub fn render(&mut self) -> Result<&[usize], CoreError> {
        self.advance_to(PipelineState::Render)?;
        self.rendered = self
            .selected
            .iter()
            .enumerate()
            .filter(|(_, selected)| **selected)
            .map(|(i, _)| i)
            .collect();
        self.advance_to(PipelineState::Rendered)?;
        Ok(&self.rendered)
    }
}

impl CacheEntry for Page {
    fn byte_size(&self) -> u64 {
        (self.points.len() * size_of::<PointRecord>()
            + self.attributes.len() * size_of::<SideAttributes>()
            + self.selected.len()
            + self.rendered.len() * size_of::<usize>()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;
    use std::num::NonZeroU32;

    fn sample_point() -> PointRecord {
        PointRecord {
            position: Point3::new(0.0, 0.0, 0.0),
            intensity: 0,
            return_number: 1,
            number_of_returns: 1,
            classification: 0,
            user_data: 0,
            point_source_id: 0,
            gps_time: None,
            color: None,
        }
    }

    #[test]
    fn pipeline_advances_in_order() {
        let mut page = Page::new(NonZeroU32::new(1).unwrap());
        page.read(vec![sample_point(); 3], vec![SideAttributes::default(); 3])
            .unwrap();
        assert_eq!(page.state(), PipelineState::Read);
        page.select(vec![true, false, true]).unwrap();
        let rendered = page.render().unwrap().to_vec();
        assert_eq!(rendered, vec![0, 2]);
        assert_eq!(page.state(), PipelineState::Rendered);
    }

    #[test]
    fn cannot_go_backward() {
        let mut page = Page::new(NonZeroU32::new(1).unwrap());
        page.read(vec![], vec![]).unwrap();
        page.select(vec![]).unwrap();
        assert!(page.read(vec![], vec![]).is_err());
    }
}
