//! Lazily synchronized mirror of one agent-side model.
//!
//! The cache is sparse and demand-driven: nothing is fetched until a
//! consumer asks, concurrent demands for the same key ride the same
//! in-flight request, and row data travels in contiguous spans. The agent
//! pushes structural invalidations which are applied in arrival order;
//! inserted and removed ranges shift every cached index below them in the
//! same parent, and never adjust a row count. A count touched by a
//! structural change goes back to unknown until explicitly re-validated,
//! so a cached count is trusted only between invalidations.
//!
//! Each connection is strictly FIFO in both directions, so a response that
//! arrives after a structural notification was produced after the agent
//! applied that change. Responses are therefore stored at the coordinates
//! they carry, at face value; only already-cached state is shifted.
//!
//! Staleness is recoverable by construction: all writes originate from the
//! single authoritative agent, so a stale client index is only ever cause
//! for a corrective refetch, never a correctness hazard.

use std::collections::HashMap;

use tokio::sync::mpsc;

use periscope_core::{ModelPath, ObjectId, PathStep, Role, RowRange, Value};
use periscope_wire::{ChangeKind, LifecycleEvent, Message, RequestId};

/// Span sizing for row-data fetches.
#[derive(Debug, Clone, Copy)]
pub struct FetchConfig {
    /// Rows fetched per request. Demands inside an already-pending span do
    /// not issue new requests.
    pub span: u32,
    /// Extra rows fetched before the demanded row, anticipating a scroll in
    /// either direction.
    pub look_ahead: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            span: 32,
            look_ahead: 8,
        }
    }
}

/// What the model tells its consumer after processing inbound messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    RowCountReady {
        path: ModelPath,
        rows: u32,
        columns: u32,
    },
    /// Cell values for `range` under `path` are now cached.
    DataReady {
        path: ModelPath,
        range: RowRange,
        column: u32,
        role: Role,
    },
    /// A structural change was applied to the cache.
    Changed {
        parent: ModelPath,
        range: RowRange,
        kind: ChangeKind,
    },
    /// `path` no longer exists on the agent; its subtree was dropped.
    Stale { path: ModelPath },
    Lifecycle {
        identity: ObjectId,
        event: LifecycleEvent,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum RowCount {
    #[default]
    Unknown,
    Pending(RequestId),
    Known {
        rows: u32,
        columns: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Pending(RequestId),
    Known(Value),
}

#[derive(Debug, Default)]
struct Entry {
    count: RowCount,
    /// `(row, column, role)` to cell state. Sparse; eviction clears it
    /// without touching `count`.
    cells: HashMap<(u32, u32, Role), Cell>,
}

/// What a request was for. Responses carry their own path and range; the
/// target is kept for path-based cancellation and for telling a count reply
/// apart from a data reply.
#[derive(Debug, Clone)]
enum Target {
    RowCount { path: ModelPath },
    Data { path: ModelPath },
}

impl Target {
    const fn path(&self) -> &ModelPath {
        match self {
            Self::RowCount { path } | Self::Data { path, .. } => path,
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    target: Target,
    /// Advisory cancellation: the response is dropped on arrival.
    cancelled: bool,
}

/// Client-side mirror of the agent's model. Single-task use only; drive it
/// from the connection's event loop.
pub struct RemoteModel {
    tx: mpsc::UnboundedSender<Message>,
    config: FetchConfig,
    cache: HashMap<ModelPath, Entry>,
    pending: HashMap<RequestId, PendingRequest>,
    next_request: RequestId,
}

impl RemoteModel {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self::with_config(tx, FetchConfig::default())
    }

    #[must_use]
    pub fn with_config(tx: mpsc::UnboundedSender<Message>, config: FetchConfig) -> Self {
        Self {
            tx,
            config,
            cache: HashMap::new(),
            pending: HashMap::new(),
            next_request: 1,
        }
    }

    /// Row and column count under `path`, fetching on a miss.
    ///
    /// `None` means the count is on its way; a repeat call before the
    /// response arrives does not issue another request.
    pub fn row_count(&mut self, path: &ModelPath) -> Option<(u32, u32)> {
        match self.cache.get(path).map(|e| e.count) {
            Some(RowCount::Known { rows, columns }) => return Some((rows, columns)),
            Some(RowCount::Pending(_)) => return None,
            _ => {}
        }

        let id = self.next_id();
        self.cache.entry(path.clone()).or_default().count = RowCount::Pending(id);
        self.pending.insert(id, PendingRequest {
            target: Target::RowCount { path: path.clone() },
            cancelled: false,
        });
        self.send(Message::RowCountRequest {
            request_id: id,
            path: path.clone(),
        });
        None
    }

    /// One cell's value, fetching a surrounding span on a miss.
    pub fn value(&mut self, parent: &ModelPath, row: u32, column: u32, role: Role) -> Option<Value> {
        if let Some(entry) = self.cache.get(parent) {
            match entry.cells.get(&(row, column, role)) {
                Some(Cell::Known(v)) => return Some(v.clone()),
                Some(Cell::Pending(_)) => return None,
                None => {}
            }
        }

        let range = self.fetch_range(parent, row);
        let id = self.next_id();
        let entry = self.cache.entry(parent.clone()).or_default();
        for r in range.rows() {
            entry
                .cells
                .entry((r, column, role))
                .or_insert(Cell::Pending(id));
        }
        self.pending.insert(id, PendingRequest {
            target: Target::Data {
                path: parent.clone(),
            },
            cancelled: false,
        });
        self.send(Message::DataRequest {
            request_id: id,
            path: parent.clone(),
            range,
            column,
            role,
        });
        None
    }

    /// Peek at a cached value without triggering a fetch.
    #[must_use]
    pub fn cached_value(
        &self,
        parent: &ModelPath,
        row: u32,
        column: u32,
        role: Role,
    ) -> Option<&Value> {
        match self.cache.get(parent)?.cells.get(&(row, column, role))? {
            Cell::Known(v) => Some(v),
            Cell::Pending(_) => None,
        }
    }

    /// Peek at a cached count without triggering a fetch.
    #[must_use]
    pub fn cached_row_count(&self, path: &ModelPath) -> Option<(u32, u32)> {
        match self.cache.get(path)?.count {
            RowCount::Known { rows, columns } => Some((rows, columns)),
            _ => None,
        }
    }

    /// Write one cell. The agent applies it and reflects the result back as
    /// a `DataChanged` notification; there is no direct reply.
    pub fn set_value(&self, path: &ModelPath, role: Role, value: Value) {
        self.send(Message::SetDataRequest {
            path: path.clone(),
            role,
            value,
        });
    }

    /// Advisory cancellation of everything in flight for `path`: responses
    /// are dropped on arrival, the agent-side work is not suppressed.
    pub fn cancel(&mut self, path: &ModelPath) {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| !p.cancelled && p.target.path() == path)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.cancel_request(id);
        }
    }

    /// Drop cached cell payloads under `path`. Row counts stay valid;
    /// eviction never changes index validity for structurally tracked
    /// paths.
    pub fn evict(&mut self, path: &ModelPath) {
        if let Some(entry) = self.cache.get_mut(path) {
            entry.cells.retain(|_, c| matches!(c, Cell::Pending(_)));
        }
    }

    /// Process one inbound message, returning the consumer-visible effects.
    pub fn handle_message(&mut self, msg: Message) -> Vec<ModelEvent> {
        let mut events = Vec::new();
        match msg {
            Message::RowCountResponse {
                request_id,
                path,
                rows,
                columns,
            } => {
                let Some(pending) = self.pending.remove(&request_id) else {
                    return events;
                };
                if pending.cancelled {
                    return events;
                }
                if !matches!(pending.target, Target::RowCount { .. }) {
                    tracing::warn!(request_id, "count response for a data request");
                    return events;
                }
                // The entry that issued the request may have been rekeyed by
                // a shift since; the reply addresses its path at face value.
                self.clear_count_markers(request_id);
                self.cache.entry(path.clone()).or_default().count =
                    RowCount::Known { rows, columns };
                events.push(ModelEvent::RowCountReady {
                    path,
                    rows,
                    columns,
                });
            }

            Message::DataResponse {
                request_id,
                path,
                range,
                column,
                role,
                values,
            } => {
                let Some(pending) = self.pending.remove(&request_id) else {
                    return events;
                };
                if !matches!(pending.target, Target::Data { .. }) {
                    tracing::warn!(request_id, "data response for a count request");
                    return events;
                }
                if pending.cancelled {
                    self.clear_markers(request_id);
                    return events;
                }

                // FIFO ordering means this reply post-dates every change
                // notification seen so far: its rows are current as carried.
                let entry = self.cache.entry(path.clone()).or_default();
                for (i, value) in values.into_iter().enumerate() {
                    let client_row = range.start.saturating_add(i as u32);
                    entry
                        .cells
                        .insert((client_row, column, role), Cell::Known(value));
                }
                // The agent clamps spans that race a removal, and shifts may
                // have rekeyed the markers; whatever it did not answer must
                // be demandable again.
                self.clear_markers(request_id);

                events.push(ModelEvent::DataReady {
                    path,
                    range,
                    column,
                    role,
                });
            }

            Message::StaleIndex { request_id } => {
                let Some(pending) = self.pending.remove(&request_id) else {
                    return events;
                };
                if pending.cancelled {
                    return events;
                }
                let path = pending.target.path().clone();
                tracing::debug!(%path, "path went stale, dropping subtree");
                self.cache.retain(|p, _| !p.starts_with(&path));
                events.push(ModelEvent::Stale { path });
            }

            Message::ChangeNotification {
                parent,
                range,
                kind,
            } => {
                self.apply_change(&parent, range, kind);
                events.push(ModelEvent::Changed {
                    parent,
                    range,
                    kind,
                });
            }

            Message::ObjectLifecycle { identity, event } => {
                if event == LifecycleEvent::Destroyed {
                    self.send(Message::LifecycleAck { identity });
                }
                events.push(ModelEvent::Lifecycle { identity, event });
            }

            Message::Error { code, detail } => {
                tracing::warn!(?code, detail, "agent reported an error");
            }

            other => {
                tracing::debug!(tag = other.tag(), "ignoring unexpected message");
            }
        }
        events
    }

    fn next_id(&mut self) -> RequestId {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    fn send(&self, msg: Message) {
        // A dead connection surfaces through its own event stream.
        let _ = self.tx.send(msg);
    }

    /// Span to fetch around a demanded row, clamped to a known extent.
    fn fetch_range(&self, parent: &ModelPath, row: u32) -> RowRange {
        let look = self.config.look_ahead;
        let len = self.config.span.max(look * 2 + 1);
        let start = row.saturating_sub(look);
        let mut end = start.saturating_add(len);
        if let Some(RowCount::Known { rows, .. }) = self.cache.get(parent).map(|e| e.count) {
            end = end.min(rows.max(row.saturating_add(1)));
        }
        RowRange::new(start, end - start)
    }

    /// Apply one structural notification. Moved ranges are a removal
    /// followed by an insertion for index-shifting purposes.
    fn apply_change(&mut self, parent: &ModelPath, range: RowRange, kind: ChangeKind) {
        match kind {
            ChangeKind::DataChanged => {
                if let Some(entry) = self.cache.get_mut(parent) {
                    entry
                        .cells
                        .retain(|(row, _, _), c| {
                            !(range.contains(*row) && matches!(c, Cell::Known(_)))
                        });
                }
            }
            ChangeKind::Inserted => {
                self.shift(parent, |row| {
                    if row < range.start {
                        Some(row)
                    } else {
                        Some(row.saturating_add(range.len))
                    }
                });
                self.invalidate_count(parent);
            }
            ChangeKind::Removed => {
                self.shift(parent, |row| {
                    if row < range.start {
                        Some(row)
                    } else if range.contains(row) {
                        None
                    } else {
                        Some(row.saturating_sub(range.len))
                    }
                });
                self.invalidate_count(parent);
            }
            ChangeKind::Moved { to } => {
                self.apply_change(parent, range, ChangeKind::Removed);
                self.apply_change(parent, RowRange::new(to, range.len), ChangeKind::Inserted);
            }
        }
    }

    /// Rekey the cached state addressed through a row under `parent`: the
    /// parent's own cells and cached descendant subtrees. `map` returns the
    /// new row, or `None` for rows that ceased to exist. In-flight requests
    /// are left alone; their replies arrive in post-change coordinates and
    /// are stored as carried.
    fn shift(&mut self, parent: &ModelPath, map: impl Fn(u32) -> Option<u32>) {
        let depth = parent.len();

        if let Some(entry) = self.cache.get_mut(parent) {
            let cells = std::mem::take(&mut entry.cells);
            entry.cells = cells
                .into_iter()
                .filter_map(|((row, column, role), cell)| {
                    map(row).map(|row| ((row, column, role), cell))
                })
                .collect();
        }

        let affected: Vec<ModelPath> = self
            .cache
            .keys()
            .filter(|p| p.len() > depth && p.starts_with(parent))
            .cloned()
            .collect();
        let mut rekeyed = Vec::with_capacity(affected.len());
        for old in affected {
            let entry = self.cache.remove(&old).unwrap_or_default();
            let step = old.steps()[depth];
            if let Some(row) = map(step.row) {
                rekeyed.push((reroot(&old, depth, row), entry));
            }
        }
        for (path, entry) in rekeyed {
            self.cache.insert(path, entry);
        }
    }

    fn invalidate_count(&mut self, parent: &ModelPath) {
        let Some(entry) = self.cache.get_mut(parent) else {
            return;
        };
        // A pending count stays pending: the reply in flight was computed
        // after the change it trails and already reflects the new extent.
        if matches!(entry.count, RowCount::Known { .. }) {
            entry.count = RowCount::Unknown;
        }
    }

    fn cancel_request(&mut self, id: RequestId) {
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };
        pending.cancelled = true;
        match pending.target {
            Target::RowCount { .. } => self.clear_count_markers(id),
            Target::Data { .. } => self.clear_markers(id),
        }
    }

    /// Reset any entry still waiting on request `id` for its count. The
    /// waiting entry may have been rekeyed since the request went out, so
    /// this sweeps rather than addressing one path.
    fn clear_count_markers(&mut self, id: RequestId) {
        for entry in self.cache.values_mut() {
            if entry.count == RowCount::Pending(id) {
                entry.count = RowCount::Unknown;
            }
        }
    }

    /// Drop every cell marker waiting on request `id`, wherever shifts may
    /// have moved it.
    fn clear_markers(&mut self, id: RequestId) {
        for entry in self.cache.values_mut() {
            entry
                .cells
                .retain(|_, c| !matches!(c, Cell::Pending(p) if *p == id));
        }
    }
}

/// Replace the row of the step at `depth`, keeping everything else.
fn reroot(path: &ModelPath, depth: usize, row: u32) -> ModelPath {
    path.steps()
        .iter()
        .enumerate()
        .map(|(i, s)| {
            if i == depth {
                PathStep::new(row, s.column)
            } else {
                *s
            }
        })
        .collect()
}

/// Merge runs of overlapping or adjacent value invalidations on the same
/// parent into one superseding notification. Purely an optimization:
/// applying the coalesced sequence yields the same cache state as applying
/// the originals one at a time. Structural kinds pass through untouched,
/// since merging shifted index ranges would change their meaning.
#[must_use]
pub fn coalesce(notifications: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(notifications.len());
    for msg in notifications {
        if let Message::ChangeNotification {
            parent,
            range,
            kind: ChangeKind::DataChanged,
        } = &msg
        {
            if let Some(Message::ChangeNotification {
                parent: last_parent,
                range: last_range,
                kind: ChangeKind::DataChanged,
            }) = out.last_mut()
            {
                let touching = last_range.overlaps(*range)
                    || last_range.end() == range.start
                    || range.end() == last_range.start;
                if last_parent == parent && touching {
                    *last_range = last_range.union(*range);
                    continue;
                }
            }
        }
        out.push(msg);
    }
    out
}
