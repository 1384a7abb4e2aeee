//! The replay/resume protocol: tracked postpones and the resume token.
//!
//! A resumable render records every deliberately deferred subtree into a
//! ledger addressed by key path. At the end of the pass the ledger
//! serializes into a versioned [`ResumeToken`]; a later render walks the
//! same tree, matches recorded `(name, key-or-index)` frames structurally,
//! and picks up work at exactly the recorded slots. Any disagreement
//! between the resumed tree and the ledger downgrades the affected
//! boundaries to client-rendered fallbacks instead of corrupting output.
//!
//! On the wire a replay node is the 4-tuple
//! `[name, keyOrIndex, children, slotOrNull]`; a slot is a segment number,
//! a map of child index to segment number, or null. A node named like a
//! suspense boundary whose slot is a number resumes that boundary (the
//! number is the shared boundary/content wire id).

use crate::error::{ErrorKind, RenderError};
use crate::format::FormatContext;
use crate::render::boundary::BoundaryStatus;
use crate::render::request::Request;
use crate::render::segment::SegmentStatus;
use crate::resources::ResumableState;
use crate::types::{BoundaryId, KeyOrIndex, KeyPath, SegmentId};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// Current schema version for resume tokens.
///
/// Increment this when making breaking changes to the layout.
pub const RESUME_SCHEMA_VERSION: u32 = 1;

/// A resumable position, or the absence of one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResumeSlot {
    /// Nothing resumable at this node itself.
    #[default]
    None,
    /// A single resumable segment (or, on a boundary node, the shared
    /// boundary/content wire id).
    Id(u32),
    /// Resumable segments below this node, keyed by child index.
    Children(BTreeMap<u32, u32>),
}

impl ResumeSlot {
    /// Returns true if no position is recorded.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// One recorded node in the replay tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "NodeTuple", into = "NodeTuple")]
pub struct ResumeNode {
    /// Node name contributed to the key path, if the node had one.
    pub name: Option<String>,
    /// Explicit key or sibling index.
    pub key: KeyOrIndex,
    /// Recorded descendants on the way to deeper slots.
    pub children: Vec<ResumeNode>,
    /// This node's own resumable position.
    pub slot: ResumeSlot,
}

#[derive(Serialize, Deserialize)]
struct NodeTuple(
    Option<String>,
    KeyOrIndex,
    Vec<ResumeNode>,
    ResumeSlot,
);

impl From<NodeTuple> for ResumeNode {
    fn from(t: NodeTuple) -> Self {
        Self {
            name: t.0,
            key: t.1,
            children: t.2,
            slot: t.3,
        }
    }
}

impl From<ResumeNode> for NodeTuple {
    fn from(n: ResumeNode) -> Self {
        Self(n.name, n.key, n.children, n.slot)
    }
}

impl ResumeNode {
    /// Structural match against a tree position.
    pub(crate) fn matches(&self, name: Option<&str>, key: &KeyOrIndex) -> bool {
        if self.key != *key {
            return false;
        }
        match (&self.name, name) {
            (None, _) => true,
            (Some(recorded), Some(actual)) => recorded == actual,
            (Some(_), None) => false,
        }
    }
}

/// Decode failures for [`ResumeToken`].
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token bytes are not a valid serialized token.
    #[error("malformed resume token: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The token was produced by an incompatible schema version.
    #[error("unsupported resume token version {found} (supported: {supported})")]
    Version {
        /// Version found in the token.
        found: u32,
        /// Version this build supports.
        supported: u32,
    },
}

impl From<TokenError> for RenderError {
    fn from(e: TokenError) -> Self {
        RenderError::new(ErrorKind::TokenDecode).with_message(e.to_string())
    }
}

/// The externally-visible resume token: everything a later pass needs to
/// splice real content into the positions a previous pass deferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeToken {
    pub(crate) version: u32,
    #[serde(rename = "nextSegmentId")]
    pub(crate) next_wire_id: u32,
    #[serde(rename = "rootFormatContext")]
    pub(crate) root_format_context: FormatContext,
    #[serde(rename = "progressiveChunkSizeBytes")]
    pub(crate) progressive_chunk_size: usize,
    #[serde(rename = "resumableState")]
    pub(crate) resumable: ResumableState,
    #[serde(rename = "replayNodes")]
    pub(crate) replay_nodes: Vec<ResumeNode>,
    #[serde(rename = "replayRootSlot")]
    pub(crate) replay_root_slot: ResumeSlot,
}

impl ResumeToken {
    /// Serializes the token to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TokenError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a token from JSON bytes, checking the schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are malformed or the version is
    /// unsupported.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        let token: Self = serde_json::from_slice(bytes)?;
        if token.version != RESUME_SCHEMA_VERSION {
            return Err(TokenError::Version {
                found: token.version,
                supported: RESUME_SCHEMA_VERSION,
            });
        }
        Ok(token)
    }

    /// Returns the recorded replay nodes.
    #[must_use]
    pub fn replay_nodes(&self) -> &[ResumeNode] {
        &self.replay_nodes
    }

    /// Returns the recorded root slot.
    #[must_use]
    pub fn replay_root_slot(&self) -> &ResumeSlot {
        &self.replay_root_slot
    }
}

// =============================================================================
// Replay frames (resume side)
// =============================================================================

/// One level of the replay walk, shared by every task working under it so
/// the last finisher can verify the ledger was fully consumed.
pub(crate) struct ReplayFrame {
    /// Unconsumed recorded children at this level.
    pub(crate) nodes: Vec<ResumeNode>,
    /// Unconsumed child-index slots at this level.
    pub(crate) slots: BTreeMap<u32, u32>,
    /// Tasks currently walking this frame.
    pub(crate) pending: u32,
}

pub(crate) type ReplayFrameRef = Rc<RefCell<ReplayFrame>>;

impl ReplayFrame {
    pub(crate) fn new(nodes: Vec<ResumeNode>, slots: BTreeMap<u32, u32>) -> ReplayFrameRef {
        Rc::new(RefCell::new(Self {
            nodes,
            slots,
            pending: 1,
        }))
    }

    /// Builds the frame for walking below `node`.
    pub(crate) fn for_node(node: &ResumeNode) -> ReplayFrameRef {
        let slots = match &node.slot {
            ResumeSlot::Children(map) => map.clone(),
            ResumeSlot::None | ResumeSlot::Id(_) => BTreeMap::new(),
        };
        Self::new(node.children.clone(), slots)
    }
}

// =============================================================================
// Tracked postpones (prerender side)
// =============================================================================

struct PostponeNode {
    name: Option<String>,
    key: KeyOrIndex,
    children: Vec<PostponeNodeRef>,
    slot: ResumeSlot,
}

type PostponeNodeRef = Rc<RefCell<PostponeNode>>;

/// The resume ledger built up while a resumable render runs.
#[derive(Default)]
pub(crate) struct TrackedPostpones {
    working: HashMap<KeyPath, PostponeNodeRef>,
    root_nodes: Vec<PostponeNodeRef>,
    root_slot: ResumeSlot,
}

impl TrackedPostpones {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.root_nodes.is_empty() && self.root_slot.is_none()
    }

    fn get_or_create(&mut self, key_path: &KeyPath) -> PostponeNodeRef {
        if let Some(node) = self.working.get(key_path) {
            return node.clone();
        }
        let node = Rc::new(RefCell::new(PostponeNode {
            name: key_path.name().map(str::to_owned),
            key: key_path.key().cloned().unwrap_or(KeyOrIndex::Index(0)),
            children: Vec::new(),
            slot: ResumeSlot::None,
        }));
        self.working.insert(key_path.clone(), node.clone());
        self.add_to_parent(&key_path.parent(), node.clone());
        node
    }

    fn add_to_parent(&mut self, parent: &KeyPath, node: PostponeNodeRef) {
        if parent.is_root() {
            self.root_nodes.push(node);
        } else {
            let parent_node = self.get_or_create(parent);
            parent_node.borrow_mut().children.push(node);
        }
    }

    fn finalize_node(node: &PostponeNodeRef) -> ResumeNode {
        let node = node.borrow();
        ResumeNode {
            name: node.name.clone(),
            key: node.key.clone(),
            children: node.children.iter().map(Self::finalize_node).collect(),
            slot: node.slot.clone(),
        }
    }

    fn finalize(self) -> (Vec<ResumeNode>, ResumeSlot) {
        let nodes = self.root_nodes.iter().map(Self::finalize_node).collect();
        (nodes, self.root_slot)
    }
}

/// Records a deliberately deferred segment into the ledger.
///
/// The caller guarantees resumable mode is active and the task has an
/// enclosing boundary; postponing the bare root is rejected earlier as a
/// configuration error.
pub(crate) fn track_postpone(
    req: &mut Request,
    key_path: &KeyPath,
    child_index: i32,
    boundary_id: BoundaryId,
    seg_id: SegmentId,
) {
    let Some(mut tracked) = req.tracked.take() else {
        return;
    };
    req.segments[seg_id.index()].status = SegmentStatus::Postponed;

    // First postpone under this boundary: it stops completing in this pass
    // and becomes resumable under its content key path.
    let boundary_wire_id = match req.boundaries[boundary_id.index()].wire_id {
        Some(id) => id,
        None => {
            let id = req.next_wire_id;
            req.next_wire_id += 1;
            req.boundaries[boundary_id.index()].wire_id = Some(id);
            id
        }
    };
    let content_kp = req.boundaries[boundary_id.index()].content_key_path.clone();
    if req.boundaries[boundary_id.index()].status == BoundaryStatus::Pending {
        req.boundaries[boundary_id.index()].status = BoundaryStatus::Postponed;

        if content_kp == *key_path && child_index < 0 {
            // The whole content root postponed: the content segment shares
            // the boundary's wire number and resumes as a full re-render.
            req.segments[seg_id.index()].wire_id = Some(boundary_wire_id);
            let node = tracked.get_or_create(&content_kp);
            {
                let mut node = node.borrow_mut();
                node.children.clear();
                node.slot = ResumeSlot::Id(boundary_wire_id);
            }
            req.tracked = Some(tracked);
            return;
        }
        // Partial: make sure the boundary node exists carrying its wire id.
        let node = tracked.get_or_create(&content_kp);
        node.borrow_mut().slot = ResumeSlot::Id(boundary_wire_id);
    }

    // Record the postponed segment itself. A segment whose parent already
    // flushed is the boundary's content root (possibly via compaction) and
    // adopts the boundary's number, so the resume patch lands on the
    // anchor the first pass delivered.
    let seg_wire_id = match req.segments[seg_id.index()].wire_id {
        Some(id) => id,
        None => {
            let id = if req.segments[seg_id.index()].parent_flushed {
                boundary_wire_id
            } else {
                let fresh = req.next_wire_id;
                req.next_wire_id += 1;
                fresh
            };
            req.segments[seg_id.index()].wire_id = Some(id);
            id
        }
    };

    if child_index < 0 {
        if key_path.is_root() {
            tracked.root_slot = ResumeSlot::Id(seg_wire_id);
        } else {
            let node = tracked.get_or_create(key_path);
            node.borrow_mut().slot = ResumeSlot::Id(seg_wire_id);
        }
    } else {
        let idx = child_index as u32;
        if key_path.is_root() {
            match &mut tracked.root_slot {
                ResumeSlot::None => {
                    let mut map = BTreeMap::new();
                    map.insert(idx, seg_wire_id);
                    tracked.root_slot = ResumeSlot::Children(map);
                }
                ResumeSlot::Children(map) => {
                    map.insert(idx, seg_wire_id);
                }
                ResumeSlot::Id(_) => {
                    debug_assert!(false, "postponed both a node and a slot below it");
                }
            }
        } else {
            let node = tracked.get_or_create(key_path);
            let mut node = node.borrow_mut();
            match &mut node.slot {
                // A node already carrying an id slot is a boundary node
                // (a plain whole-node slot leaves nothing below to
                // postpone); record the child as a nested slot node so the
                // boundary id stays in place.
                ResumeSlot::Id(_) => {
                    node.children.push(Rc::new(RefCell::new(PostponeNode {
                        name: None,
                        key: KeyOrIndex::Index(idx),
                        children: Vec::new(),
                        slot: ResumeSlot::Id(seg_wire_id),
                    })));
                }
                ResumeSlot::None => {
                    let mut map = BTreeMap::new();
                    map.insert(idx, seg_wire_id);
                    node.slot = ResumeSlot::Children(map);
                }
                ResumeSlot::Children(map) => {
                    map.insert(idx, seg_wire_id);
                }
            }
        }
    }
    req.tracked = Some(tracked);
}

/// Neuters a boundary's ledger node after the boundary failed or aborted,
/// so a resume pass does not try to fill it.
pub(crate) fn untrack_boundary(req: &mut Request, boundary_id: BoundaryId) {
    let Some(tracked) = req.tracked.as_mut() else {
        return;
    };
    let content_kp = req.boundaries[boundary_id.index()].content_key_path.clone();
    if let Some(node) = tracked.working.get(&content_kp) {
        let mut node = node.borrow_mut();
        node.children.clear();
        node.slot = ResumeSlot::None;
    }
}

/// Serializes the ledger into a resume token, if anything was postponed.
pub(crate) fn postponed_state(req: &mut Request) -> Option<ResumeToken> {
    let tracked = req.tracked.take()?;
    if tracked.is_empty() {
        return None;
    }
    let mut resumable = req.resumable.clone();
    resumable.resources = req.resources.registered_keys();
    let (replay_nodes, replay_root_slot) = tracked.finalize();
    Some(ResumeToken {
        version: RESUME_SCHEMA_VERSION,
        next_wire_id: req.next_wire_id,
        root_format_context: req.root_format_context,
        progressive_chunk_size: req.progressive_chunk_size,
        resumable,
        replay_nodes,
        replay_root_slot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(name: &str, index: u32, slot: ResumeSlot) -> ResumeNode {
        ResumeNode {
            name: Some(name.to_owned()),
            key: KeyOrIndex::Index(index),
            children: Vec::new(),
            slot,
        }
    }

    #[test]
    fn node_serializes_as_four_tuple() {
        let node = ResumeNode {
            name: Some("Suspense".to_owned()),
            key: KeyOrIndex::Index(2),
            children: vec![leaf("section", 0, ResumeSlot::Id(7))],
            slot: ResumeSlot::Id(3),
        };
        let value = serde_json::to_value(&node).expect("serialize");
        assert_eq!(
            value,
            json!(["Suspense", 2, [["section", 0, [], 7]], 3])
        );
    }

    #[test]
    fn slot_forms_round_trip() {
        let mut map = BTreeMap::new();
        map.insert(1u32, 9u32);
        for slot in [ResumeSlot::None, ResumeSlot::Id(4), ResumeSlot::Children(map)] {
            let bytes = serde_json::to_vec(&slot).expect("serialize");
            let back: ResumeSlot = serde_json::from_slice(&bytes).expect("deserialize");
            assert_eq!(back, slot);
        }
    }

    #[test]
    fn token_round_trip() {
        let token = ResumeToken {
            version: RESUME_SCHEMA_VERSION,
            next_wire_id: 12,
            root_format_context: FormatContext::root(),
            progressive_chunk_size: 12800,
            resumable: ResumableState::default(),
            replay_nodes: vec![leaf("Suspense", 0, ResumeSlot::Id(2))],
            replay_root_slot: ResumeSlot::None,
        };
        let bytes = token.to_bytes().expect("serialize");
        let back = ResumeToken::from_bytes(&bytes).expect("deserialize");
        assert_eq!(back.next_wire_id, 12);
        assert_eq!(back.replay_nodes, token.replay_nodes);
        assert_eq!(back.replay_root_slot, ResumeSlot::None);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut token = ResumeToken {
            version: RESUME_SCHEMA_VERSION + 1,
            next_wire_id: 0,
            root_format_context: FormatContext::root(),
            progressive_chunk_size: 12800,
            resumable: ResumableState::default(),
            replay_nodes: Vec::new(),
            replay_root_slot: ResumeSlot::None,
        };
        let bytes = token.to_bytes().expect("serialize");
        let err = ResumeToken::from_bytes(&bytes).expect_err("rejected");
        assert!(matches!(err, TokenError::Version { .. }));
        token.version = RESUME_SCHEMA_VERSION;
        let bytes = token.to_bytes().expect("serialize");
        assert!(ResumeToken::from_bytes(&bytes).is_ok());
    }

    #[test]
    fn matches_is_structural() {
        let node = leaf("item", 3, ResumeSlot::None);
        assert!(node.matches(Some("item"), &KeyOrIndex::Index(3)));
        assert!(!node.matches(Some("item"), &KeyOrIndex::Index(4)));
        assert!(!node.matches(Some("other"), &KeyOrIndex::Index(3)));
        assert!(!node.matches(None, &KeyOrIndex::Index(3)));

        let anonymous = ResumeNode {
            name: None,
            key: KeyOrIndex::Index(1),
            children: Vec::new(),
            slot: ResumeSlot::Id(5),
        };
        assert!(anonymous.matches(Some("whatever"), &KeyOrIndex::Index(1)));
        assert!(anonymous.matches(None, &KeyOrIndex::Index(1)));
    }
}
